//! Managed worker threads with cooperative stop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use crate::error::Result;

/// Shared stop flag handed to a worker body
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stop: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait up to `timeout` for work. Returns early when a stop is requested.
    pub fn idle(&self, timeout: Duration) {
        if !self.is_stopped() {
            thread::park_timeout(timeout);
        }
    }
}

/// A named worker thread owning one loop.
///
/// Dropping a task that was never joined stops and joins it.
pub struct Task<R: Send + 'static> {
    name: String,
    token: StopToken,
    handle: Option<JoinHandle<R>>,
}

impl<R: Send + 'static> Task<R> {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(StopToken) -> R + Send + 'static,
    {
        let name = name.into();
        let token = StopToken::new();
        let worker_token = token.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(worker_token))?;
        debug!(task = %name, "spawned");
        Ok(Self {
            name,
            token,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &StopToken {
        &self.token
    }

    pub fn request_stop(&self) {
        self.token.stop();
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the worker and wait for it. `None` if the body panicked.
    pub fn join(mut self) -> Option<R> {
        self.request_stop();
        self.join_inner()
    }

    fn join_inner(&mut self) -> Option<R> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(value) => {
                debug!(task = %self.name, "joined");
                Some(value)
            }
            Err(_) => {
                error!(task = %self.name, "worker panicked");
                None
            }
        }
    }
}

impl<R: Send + 'static> Drop for Task<R> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.request_stop();
            let _ = self.join_inner();
        }
    }
}
