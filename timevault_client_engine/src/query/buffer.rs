// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::TimeoutPhase;
use crate::query::RawRecord;
use crate::ErrorKind;

/// Lifecycle of a [`RecordBuffer`].
///
/// `Closed -> Active -> Shuttable -> Done`. Pushes are accepted only while
/// `Active`; a `Shuttable` buffer rejects pushes but keeps serving pops
/// until drained, at which point it transitions to `Done` on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Closed,
    Active,
    Shuttable,
    Done,
}

struct Inner {
    queue: VecDeque<RawRecord>,
    state: BufferState,
}

/// Bounded, thread-safe FIFO of [`RawRecord`]s mediating the stream
/// workers (push side) and the transfer task (pop side).
///
/// The internal lock is the only synchronization point between producers
/// and consumer; everything else in the pipeline communicates through it.
pub struct RecordBuffer {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: Option<usize>,
    backpressure: bool,
}

impl RecordBuffer {
    /// `capacity: None` means unbounded: pushes never block regardless of
    /// the backpressure flag.
    pub fn new(capacity: Option<usize>, backpressure: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                state: BufferState::Closed,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
            backpressure,
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::new(Some(capacity.max(1)), true)
    }

    pub fn unbounded() -> Self {
        Self::new(None, true)
    }

    pub fn state(&self) -> BufferState {
        self.inner.lock().unwrap().state
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transitions `Closed -> Active`. Idempotent while active; returns
    /// `false` once the buffer has moved on towards `Done`.
    pub fn activate(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BufferState::Closed => {
                inner.state = BufferState::Active;
                true
            }
            BufferState::Active => true,
            BufferState::Shuttable | BufferState::Done => false,
        }
    }

    /// Enqueues one record, blocking while the buffer is full (bounded
    /// mode with backpressure). Fails with [`ErrorKind::BufferExhausted`]
    /// when full and backpressure is off, and with
    /// [`ErrorKind::BufferShutdown`] whenever the buffer is not `Active`.
    pub fn push(&self, record: RawRecord) -> crate::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.state != BufferState::Active {
                return Err(ErrorKind::BufferShutdown.into());
            }
            let full = self
                .capacity
                .is_some_and(|capacity| inner.queue.len() >= capacity);
            if !full {
                inner.queue.push_back(record);
                self.not_empty.notify_one();
                return Ok(());
            }
            if !self.backpressure {
                return Err(ErrorKind::BufferExhausted.into());
            }
            inner = self.not_full.wait(inner).unwrap();
        }
    }

    /// Dequeues one record, blocking up to `timeout`.
    ///
    /// Returns `Ok(None)` only once the buffer is `Shuttable` and drained
    /// (or already `Done`); an expired timeout while the buffer is still
    /// live is a [`TimeoutPhase::Transfer`] timeout the caller may retry.
    pub fn pop(&self, timeout: Duration) -> crate::Result<Option<RawRecord>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(record) = inner.queue.pop_front() {
                if inner.queue.is_empty() && inner.state == BufferState::Shuttable {
                    inner.state = BufferState::Done;
                    self.not_empty.notify_all();
                }
                self.not_full.notify_all();
                return Ok(Some(record));
            }
            match inner.state {
                BufferState::Shuttable => {
                    inner.state = BufferState::Done;
                    self.not_empty.notify_all();
                    self.not_full.notify_all();
                    return Ok(None);
                }
                BufferState::Done => return Ok(None),
                BufferState::Closed | BufferState::Active => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ErrorKind::Timeout {
                            phase: TimeoutPhase::Transfer,
                        }
                        .into());
                    }
                    let (guard, _) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
                    inner = guard;
                }
            }
        }
    }

    /// Stops accepting pushes without waiting for the drain: `Active`
    /// becomes `Shuttable` (or straight to `Done` when already empty).
    /// Blocked pushers wake and fail; blocked poppers wake and drain.
    pub fn seal(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BufferState::Closed => inner.state = BufferState::Done,
            BufferState::Active => {
                inner.state = if inner.queue.is_empty() {
                    BufferState::Done
                } else {
                    BufferState::Shuttable
                };
                self.not_empty.notify_all();
                self.not_full.notify_all();
            }
            BufferState::Shuttable | BufferState::Done => {}
        }
    }

    /// Seals the buffer and blocks until the consumer has drained it.
    pub fn shutdown(&self) {
        self.seal();
        let mut inner = self.inner.lock().unwrap();
        while inner.state != BufferState::Done {
            inner = self.not_full.wait(inner).unwrap();
        }
    }

    /// Discards any residual records and transitions directly to `Done`.
    pub fn shutdown_now(&self) {
        let mut inner = self.inner.lock().unwrap();
        let discarded = inner.queue.len();
        inner.queue.clear();
        inner.state = BufferState::Done;
        if discarded > 0 {
            tracing::debug!(discarded, "response buffer discarded residual records");
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::query::value::ColumnValues;
    use crate::query::{RecordTiming, SamplingClock};

    fn record(n: i32) -> RawRecord {
        RawRecord::new(
            format!("src{n}"),
            RecordTiming::Clock(SamplingClock::new(0, 1, 1)),
            ColumnValues::Int32(vec![n]),
        )
    }

    const POLL: Duration = Duration::from_millis(200);

    #[test]
    fn push_requires_activation() {
        let buffer = RecordBuffer::bounded(4);
        assert_eq!(buffer.state(), BufferState::Closed);
        assert_eq!(
            buffer.push(record(0)).unwrap_err().kind(),
            &ErrorKind::BufferShutdown
        );
        assert!(buffer.activate());
        assert!(buffer.activate(), "activation is idempotent");
        buffer.push(record(0)).unwrap();
    }

    #[test]
    fn activation_fails_after_shutdown() {
        let buffer = RecordBuffer::bounded(4);
        buffer.activate();
        buffer.shutdown_now();
        assert!(!buffer.activate());
        assert_eq!(buffer.state(), BufferState::Done);
    }

    #[test]
    fn sealed_buffer_drains_then_reports_none() {
        let buffer = RecordBuffer::bounded(4);
        buffer.activate();
        buffer.push(record(1)).unwrap();
        buffer.push(record(2)).unwrap();
        buffer.seal();
        assert_eq!(
            buffer.push(record(3)).unwrap_err().kind(),
            &ErrorKind::BufferShutdown
        );
        assert_eq!(buffer.pop(POLL).unwrap().unwrap(), record(1));
        assert_eq!(buffer.pop(POLL).unwrap().unwrap(), record(2));
        assert_eq!(buffer.pop(POLL).unwrap(), None);
        assert_eq!(buffer.state(), BufferState::Done);
    }

    #[test]
    fn pop_times_out_while_buffer_is_live() {
        let buffer = RecordBuffer::bounded(4);
        buffer.activate();
        let err = buffer.pop(Duration::from_millis(10)).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Timeout {
                phase: TimeoutPhase::Transfer
            }
        );
    }

    #[test]
    fn bounded_push_blocks_until_a_pop_frees_space() {
        let buffer = Arc::new(RecordBuffer::bounded(1));
        buffer.activate();
        buffer.push(record(0)).unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.push(record(1)))
        };
        // The producer cannot finish until we make room.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(buffer.pop(POLL).unwrap().unwrap(), record(0));
        producer.join().unwrap().unwrap();
        assert_eq!(buffer.pop(POLL).unwrap().unwrap(), record(1));
    }

    #[test]
    fn full_buffer_without_backpressure_fails_the_push() {
        let buffer = RecordBuffer::new(Some(1), false);
        buffer.activate();
        buffer.push(record(0)).unwrap();
        assert_eq!(
            buffer.push(record(1)).unwrap_err().kind(),
            &ErrorKind::BufferExhausted
        );
    }

    #[test]
    fn unbounded_buffer_never_blocks() {
        let buffer = RecordBuffer::unbounded();
        buffer.activate();
        for i in 0..10_000 {
            buffer.push(record(i)).unwrap();
        }
        assert_eq!(buffer.len(), 10_000);
    }

    #[test]
    fn shutdown_waits_for_the_drain() {
        let buffer = Arc::new(RecordBuffer::bounded(4));
        buffer.activate();
        buffer.push(record(0)).unwrap();
        buffer.push(record(1)).unwrap();

        let consumer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                let mut drained = 0;
                while buffer.pop(POLL).unwrap().is_some() {
                    drained += 1;
                }
                drained
            })
        };
        buffer.shutdown();
        assert_eq!(buffer.state(), BufferState::Done);
        assert_eq!(consumer.join().unwrap(), 2);
    }

    #[test]
    fn shutdown_now_discards_residual_records() {
        let buffer = RecordBuffer::bounded(4);
        buffer.activate();
        buffer.push(record(0)).unwrap();
        buffer.shutdown_now();
        assert_eq!(buffer.pop(POLL).unwrap(), None);
        assert!(buffer.is_empty());
    }
}
