//! Cross-thread handoff of composited frames to the encoder.
//!
//! The render thread pushes read-back pixel buffers; a dedicated consumer
//! thread drains them in FIFO order into a [`FrameSink`]. The queue is bounded:
//! when the consumer falls behind, new frames are dropped instead of stalling
//! rendering.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::{FilterError, FilterResult};
use crate::types::Size;

/// Receives composited RGBA frames (bottom row first) on the consumer thread.
pub trait FrameSink: Send {
    fn on_frame(&mut self, rgba: &[u8], width: u32, height: u32) -> anyhow::Result<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(&[u8], u32, u32) -> anyhow::Result<()> + Send,
{
    fn on_frame(&mut self, rgba: &[u8], width: u32, height: u32) -> anyhow::Result<()> {
        self(rgba, width, height)
    }
}

/// One read-back frame owned by the relay until the consumer is done with it.
#[derive(Debug)]
pub struct PixelBuffer {
    pub data: Vec<u8>,
    pub size: Size,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub pushed: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    pushed: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Spare pixel buffers handed back by the consumer.
#[derive(Debug, Default)]
struct BufferPool {
    spare: Mutex<Vec<Vec<u8>>>,
    limit: usize,
}

impl BufferPool {
    fn take(&self) -> Vec<u8> {
        lock(&self.spare).pop().unwrap_or_default()
    }

    fn recycle(&self, mut buffer: Vec<u8>) {
        let mut spare = lock(&self.spare);
        if spare.len() < self.limit {
            buffer.clear();
            spare.push(buffer);
        }
    }
}

struct Worker {
    sender: Sender<PixelBuffer>,
    receiver: Receiver<PixelBuffer>,
    join: JoinHandle<()>,
}

pub struct FrameRelay {
    capacity: usize,
    wait: Duration,
    active: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
    pool: Arc<BufferPool>,
    counters: Arc<Counters>,
    sequence: AtomicU64,
}

impl std::fmt::Debug for FrameRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRelay")
            .field("capacity", &self.capacity)
            .field("wait", &self.wait)
            .field("active", &self.is_active())
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FrameRelay {
    pub fn new(capacity: usize, wait: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            wait,
            active: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            pool: Arc::new(BufferPool {
                spare: Mutex::new(Vec::new()),
                limit: capacity + 2,
            }),
            counters: Arc::new(Counters::default()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }

    /// Starts the consumer thread feeding `sink`.
    pub fn enable(&self, sink: Box<dyn FrameSink>) -> FilterResult<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(FilterError::State {
                operation: "enable the frame relay",
                state: "encoding".to_string(),
            });
        }

        let (sender, receiver) = bounded(self.capacity);
        let consumer = Consumer {
            receiver: receiver.clone(),
            active: Arc::clone(&self.active),
            wait: self.wait,
            pool: Arc::clone(&self.pool),
            counters: Arc::clone(&self.counters),
            sink,
        };
        self.active.store(true, Ordering::Release);
        let join = thread::Builder::new()
            .name("filterchain-relay".into())
            .spawn(move || consumer.run())
            .map_err(|err| {
                self.active.store(false, Ordering::Release);
                FilterError::Resource(format!("failed to spawn relay consumer: {err}"))
            })?;

        tracing::debug!(capacity = self.capacity, wait = ?self.wait, "frame relay enabled");
        *worker = Some(Worker {
            sender,
            receiver,
            join,
        });
        Ok(())
    }

    /// Stops the consumer, discarding queued frames. No-op when not enabled.
    pub fn disable(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        self.active.store(false, Ordering::Release);
        let Worker {
            sender,
            receiver,
            join,
        } = worker;
        let discarded = receiver
            .try_iter()
            .map(|frame| self.pool.recycle(frame.data))
            .count();
        drop(sender);
        drop(receiver);
        if join.join().is_err() {
            tracing::error!("frame relay consumer panicked");
        }
        tracing::debug!(discarded, "frame relay disabled");
    }

    /// Returns an empty buffer for the next readback, reusing a recycled one when possible.
    pub fn acquire_buffer(&self) -> Vec<u8> {
        self.pool.take()
    }

    /// Queues a frame for the consumer. Never blocks; returns `false` when the
    /// relay is disabled or the queue is full.
    pub fn push(&self, data: Vec<u8>, size: Size) -> bool {
        if !self.is_active() {
            self.pool.recycle(data);
            return false;
        }
        let worker = lock(&self.worker);
        let Some(worker) = worker.as_ref() else {
            self.pool.recycle(data);
            return false;
        };
        let frame = PixelBuffer {
            data,
            size,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        match worker.sender.try_send(frame) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(frame)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(sequence = frame.sequence, "relay queue full; dropping frame");
                self.pool.recycle(frame.data);
                false
            }
            Err(TrySendError::Disconnected(frame)) => {
                self.pool.recycle(frame.data);
                false
            }
        }
    }
}

impl Drop for FrameRelay {
    fn drop(&mut self) {
        self.disable();
    }
}

struct Consumer {
    receiver: Receiver<PixelBuffer>,
    active: Arc<AtomicBool>,
    wait: Duration,
    pool: Arc<BufferPool>,
    counters: Arc<Counters>,
    sink: Box<dyn FrameSink>,
}

impl Consumer {
    fn run(mut self) {
        let mut scratch = Vec::new();
        loop {
            match self.receiver.recv_timeout(self.wait) {
                Ok(frame) => {
                    if !self.active.load(Ordering::Acquire) {
                        self.pool.recycle(frame.data);
                        continue;
                    }
                    scratch.clear();
                    scratch.extend_from_slice(&frame.data);
                    let PixelBuffer { data, size, sequence } = frame;
                    self.pool.recycle(data);
                    self.deliver(&scratch, size, sequence);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.active.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("frame relay consumer stopped");
    }

    fn deliver(&mut self, rgba: &[u8], size: Size, sequence: u64) {
        let sink = &mut self.sink;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            sink.on_frame(rgba, size.width, size.height)
        }));
        match outcome {
            Ok(Ok(())) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sequence, error = %err, "frame sink failed");
            }
            Err(payload) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|message| message.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(sequence, panic = %message, "frame sink panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crossbeam_channel::unbounded;

    fn frame(value: u8) -> Vec<u8> {
        vec![value; 4]
    }

    fn noop_sink() -> Box<dyn FrameSink> {
        Box::new(|_: &[u8], _: u32, _: u32| -> anyhow::Result<()> { Ok(()) })
    }

    #[test]
    fn push_while_disabled_is_ignored() {
        let relay = FrameRelay::new(4, Duration::from_millis(50));
        assert!(!relay.push(frame(1), Size::new(1, 1)));
        assert_eq!(relay.stats(), RelayStats::default());
    }

    #[test]
    fn enabling_twice_is_a_state_error() {
        let relay = FrameRelay::new(4, Duration::from_millis(50));
        relay.enable(noop_sink()).unwrap();
        let err = relay.enable(noop_sink()).unwrap_err();
        assert!(matches!(err, FilterError::State { .. }));
        relay.disable();
        assert!(!relay.is_active());
    }

    #[test]
    fn full_queue_drops_new_frames() {
        let (gate_tx, gate_rx) = unbounded::<()>();
        let relay = FrameRelay::new(2, Duration::from_millis(50));
        relay
            .enable(Box::new(move |_: &[u8], _: u32, _: u32| -> anyhow::Result<()> {
                let _ = gate_rx.recv();
                Ok(())
            }))
            .unwrap();

        // The consumer holds at most one frame while blocked, the queue two more.
        let accepted = (0..8u8)
            .filter(|value| relay.push(frame(*value), Size::new(1, 1)))
            .count();
        assert!(accepted <= 3, "accepted {accepted}");
        assert!(relay.stats().dropped >= 5);

        drop(gate_tx);
        relay.disable();
    }

    #[test]
    fn disable_returns_promptly_when_idle() {
        let relay = FrameRelay::new(4, Duration::from_millis(100));
        relay.enable(noop_sink()).unwrap();
        let started = Instant::now();
        relay.disable();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn buffers_are_recycled() {
        let relay = FrameRelay::new(4, Duration::from_millis(50));
        relay.pool.recycle(Vec::with_capacity(64));
        let buffer = relay.acquire_buffer();
        assert!(buffer.is_empty());
        assert!(buffer.capacity() >= 64);
    }
}
