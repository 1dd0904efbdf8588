//! Unbounded byte queue between the background reader and the command processor.

use std::{collections::VecDeque, time::Instant};

use parking_lot::{Condvar, Mutex};

use crate::GpibError;

#[derive(Debug, Default)]
struct Inner {
    bytes: VecDeque<u8>,
    closed: bool,
    overflowing: bool,
}

/// A single-producer/single-consumer byte queue.
///
/// The producer never blocks: when more than `warn_threshold` bytes are buffered a warning is
/// logged once, and the warning is re-armed once the consumer drained the queue below the
/// threshold again. No byte is ever dropped.
#[derive(Debug)]
pub(crate) struct ByteChannel {
    inner: Mutex<Inner>,
    available: Condvar,
    warn_threshold: usize,
}

impl ByteChannel {
    pub(crate) fn new(warn_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: Condvar::new(),
            warn_threshold,
        }
    }

    /// Append bytes received from the gateway.
    pub(crate) fn push(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            tracing::debug!(len = data.len(), "Dropping bytes pushed after channel was closed");
            return;
        }
        inner.bytes.extend(data);
        let len = inner.bytes.len();
        if len > self.warn_threshold && !inner.overflowing {
            inner.overflowing = true;
            tracing::warn!(
                buffered = len,
                threshold = self.warn_threshold,
                "Byte channel is overflowing, consumer is too slow"
            );
        }
        drop(inner);
        self.available.notify_one();
    }

    /// Pop the next byte, waiting until `until` at the latest.
    ///
    /// Returns `Ok(None)` if no byte arrived in time and [`GpibError::Interrupted`] if the channel
    /// was closed.
    pub(crate) fn pop_until(&self, until: Instant) -> Result<Option<u8>, GpibError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(GpibError::Interrupted);
            }
            if let Some(byte) = inner.bytes.pop_front() {
                if inner.overflowing && inner.bytes.len() < self.warn_threshold {
                    inner.overflowing = false;
                }
                return Ok(Some(byte));
            }
            if self.available.wait_until(&mut inner, until).timed_out() {
                return match inner.bytes.pop_front() {
                    Some(byte) => Ok(Some(byte)),
                    None if inner.closed => Err(GpibError::Interrupted),
                    None => Ok(None),
                };
            }
        }
    }

    /// Discard all buffered bytes and return how many were dropped.
    pub(crate) fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.bytes.len();
        inner.bytes.clear();
        inner.overflowing = false;
        dropped
    }

    /// Number of currently buffered bytes.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    /// Close the channel and wake up any waiting consumer.
    pub(crate) fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
    }
}
