mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{MockAllocator, MockDevice};
use hdmirx::buffer::{BufferCategory, BufferTable};
use hdmirx::capture::{CaptureQueue, Dequeue, PixelFormat, QueueParams};
use hdmirx::Error;

fn params() -> QueueParams {
    QueueParams {
        width: 64,
        height: 32,
        format: PixelFormat::Nv12,
        buffer_count: 4,
        stride_align: 16,
    }
}

fn ready(queue: &CaptureQueue) -> hdmirx::capture::CapturedFrame {
    match queue.dequeue(Duration::from_millis(50)).unwrap() {
        Dequeue::Ready(frame) => frame,
        Dequeue::Timeout => panic!("no frame"),
    }
}

#[test]
fn dequeue_requeue_balance() {
    let device = MockDevice::new();
    let table = BufferTable::new(MockAllocator::new());
    let queue = CaptureQueue::start(device.clone(), &table, &params()).unwrap();
    assert_eq!(queue.len(), 4);
    assert_eq!(device.queued(), 4);
    assert_eq!(table.live(BufferCategory::Capture), 4);

    device.feed(2);
    let a = ready(&queue);
    let b = ready(&queue);
    assert_ne!(a.slot, b.slot);
    assert_eq!(b.sequence, a.sequence + 1);
    assert_eq!(queue.app_owned(), 2);

    queue.requeue(a.slot).unwrap();
    queue.requeue(b.slot).unwrap();
    assert_eq!(queue.app_owned(), 0);
    assert_eq!(device.queued(), 4);

    let counters = queue.counters();
    assert_eq!(counters.dequeued, 2);
    assert_eq!(counters.queued, 2);
    assert_eq!(counters.errors, 0);
}

#[test]
fn requeue_twice_is_rejected() {
    let device = MockDevice::new();
    let table = BufferTable::new(MockAllocator::new());
    let queue = CaptureQueue::start(device.clone(), &table, &params()).unwrap();

    device.feed(1);
    let frame = ready(&queue);
    queue.requeue(frame.slot).unwrap();
    assert!(matches!(
        queue.requeue(frame.slot),
        Err(Error::InvalidState(_))
    ));
    assert!(queue.requeue(99).is_err());
}

#[test]
fn timeout_without_frames() {
    let device = MockDevice::new();
    let table = BufferTable::new(MockAllocator::new());
    let queue = CaptureQueue::start(device, &table, &params()).unwrap();
    assert!(matches!(
        queue.dequeue(Duration::from_millis(10)).unwrap(),
        Dequeue::Timeout
    ));
}

#[test]
fn stop_returns_outstanding_slots_and_frees_once() {
    let device = MockDevice::new();
    let allocator = MockAllocator::new();
    let table = BufferTable::new(allocator.clone());
    let queue = CaptureQueue::start(device.clone(), &table, &params()).unwrap();

    device.feed(1);
    let _held = ready(&queue);
    assert_eq!(queue.stop(), 4);
    assert_eq!(queue.stop(), 0);
    assert_eq!(allocator.freed.load(Ordering::SeqCst), 4);
    assert_eq!(table.live_total(), 0);
    assert!(!device.is_streaming());
    assert!(matches!(
        queue.dequeue(Duration::from_millis(1)),
        Err(Error::NotStreaming)
    ));

    let ops = device.ops();
    let off = ops.iter().position(|op| op == "streamoff").unwrap();
    assert_eq!(ops[off + 1], "reqbufs 0");
}

#[test]
fn failed_stream_on_rolls_back() {
    let device = MockDevice::new();
    device.fail_stream_on.store(true, Ordering::SeqCst);
    let allocator = MockAllocator::new();
    let table = BufferTable::new(allocator.clone());

    assert!(CaptureQueue::start(device.clone(), &table, &params()).is_err());
    assert_eq!(table.live_total(), 0);
    assert_eq!(allocator.freed.load(Ordering::SeqCst), 4);
    assert_eq!(device.ops().last().map(String::as_str), Some("reqbufs 0"));
}

#[test]
fn failed_allocation_rolls_back() {
    let device = MockDevice::new();
    let allocator = MockAllocator::new();
    *allocator.fail_after.lock().unwrap() = Some(2);
    let table = BufferTable::new(allocator.clone());

    assert!(matches!(
        CaptureQueue::start(device.clone(), &table, &params()),
        Err(Error::Allocation(_))
    ));
    assert_eq!(table.live_total(), 0);
    assert_eq!(allocator.freed.load(Ordering::SeqCst), 2);
    assert!(!device.ops().contains(&"streamon".to_string()));
    assert_eq!(device.ops().last().map(String::as_str), Some("reqbufs 0"));
}

#[test]
fn failed_poll_counts_as_error() {
    let device = MockDevice::new();
    let table = BufferTable::new(MockAllocator::new());
    let queue = CaptureQueue::start(device.clone(), &table, &params()).unwrap();

    device.fail_poll.store(true, Ordering::SeqCst);
    assert!(queue.dequeue(Duration::from_millis(1)).is_err());
    assert_eq!(queue.counters().errors, 1);

    device.fail_poll.store(false, Ordering::SeqCst);
    device.feed(1);
    let frame = ready(&queue);
    queue.requeue(frame.slot).unwrap();
    assert_eq!(queue.counters().errors, 1);
}
