//! Text command surface: `action key=value ...`

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::session::EnhanceMode;
use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `capture id=<buffer id>`
    RequestCapture { buffer_id: u64 },
    /// `pq status=<0|1> mode=<mode>`
    SetEnhancement { mode: EnhanceMode },
    /// `record status=<0|1> [storePath=<file>]`
    SetRecord { enabled: bool, path: Option<PathBuf> },
    /// `refresh_hotcfg`
    RefreshConfig,
    /// `hdmiinout`
    ToggleStream,
    Start,
    Stop,
}

fn parse_args<'a>(words: impl Iterator<Item = &'a str>) -> Result<HashMap<&'a str, &'a str>, Error> {
    words
        .map(|w| {
            w.split_once('=')
                .ok_or_else(|| Error::InvalidArgument(format!("expected key=value, got {w:?}")))
        })
        .collect()
}

fn status(args: &HashMap<&str, &str>) -> Result<Option<bool>, Error> {
    match args.get("status").copied() {
        None => Ok(None),
        Some("0") => Ok(Some(false)),
        Some("1") => Ok(Some(true)),
        Some(other) => Err(Error::InvalidArgument(format!("status {other:?}"))),
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let action = words
            .next()
            .ok_or_else(|| Error::InvalidArgument("empty command".into()))?;
        let args = parse_args(words)?;

        match action {
            "capture" => {
                let id = args
                    .get("id")
                    .ok_or_else(|| Error::InvalidArgument("capture needs id=".into()))?;
                let buffer_id = id
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("buffer id {id:?}")))?;
                Ok(Command::RequestCapture { buffer_id })
            }
            "pq" => {
                let mode = match (status(&args)?, args.get("mode")) {
                    (Some(false), _) => EnhanceMode::OFF,
                    (_, Some(mode)) => mode.parse()?,
                    (_, None) => {
                        return Err(Error::InvalidArgument("pq needs mode= or status=0".into()))
                    }
                };
                Ok(Command::SetEnhancement { mode })
            }
            "record" => {
                let enabled = status(&args)?
                    .ok_or_else(|| Error::InvalidArgument("record needs status=".into()))?;
                let path = args
                    .get("storePath")
                    .or_else(|| args.get("path"))
                    .filter(|p| !p.is_empty())
                    .map(|p| PathBuf::from(*p));
                Ok(Command::SetRecord { enabled, path })
            }
            "refresh_hotcfg" => Ok(Command::RefreshConfig),
            "hdmiinout" => Ok(Command::ToggleStream),
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            other => Err(Error::InvalidArgument(format!("unknown command {other:?}"))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::RequestCapture { buffer_id } => write!(f, "capture id={buffer_id}"),
            Command::SetEnhancement { mode } => write!(f, "pq mode={}", mode.bits()),
            Command::SetRecord { enabled, path } => {
                write!(f, "record status={}", u8::from(*enabled))?;
                if let Some(path) = path {
                    write!(f, " storePath={}", path.display())?;
                }
                Ok(())
            }
            Command::RefreshConfig => f.write_str("refresh_hotcfg"),
            Command::ToggleStream => f.write_str("hdmiinout"),
            Command::Start => f.write_str("start"),
            Command::Stop => f.write_str("stop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_platform_commands() {
        assert_eq!(
            "capture id=42".parse::<Command>().unwrap(),
            Command::RequestCapture { buffer_id: 42 }
        );
        assert_eq!(
            "pq status=1 mode=5".parse::<Command>().unwrap(),
            Command::SetEnhancement {
                mode: EnhanceMode::NORMAL | EnhanceMode::LUMA_CALC
            }
        );
        assert_eq!(
            "pq status=0 mode=1".parse::<Command>().unwrap(),
            Command::SetEnhancement {
                mode: EnhanceMode::OFF
            }
        );
        assert_eq!(
            "record status=1 storePath=/tmp/a.nv12".parse::<Command>().unwrap(),
            Command::SetRecord {
                enabled: true,
                path: Some(PathBuf::from("/tmp/a.nv12"))
            }
        );
        assert_eq!("hdmiinout".parse::<Command>().unwrap(), Command::ToggleStream);
        assert_eq!(
            "refresh_hotcfg".parse::<Command>().unwrap(),
            Command::RefreshConfig
        );
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!("".parse::<Command>().is_err());
        assert!("capture".parse::<Command>().is_err());
        assert!("capture id=x".parse::<Command>().is_err());
        assert!("record status=2".parse::<Command>().is_err());
        assert!("pq mode".parse::<Command>().is_err());
        assert!("reboot".parse::<Command>().is_err());
    }

    #[test]
    fn display_parses_back() {
        let cmd = Command::SetRecord {
            enabled: false,
            path: None,
        };
        assert_eq!(cmd.to_string().parse::<Command>().unwrap(), cmd);
    }
}
