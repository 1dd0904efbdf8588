//! Background loop that drains the gateway socket into the byte channel.

use std::{
    io::{ErrorKind, Read},
    sync::Arc,
    thread,
    time::Duration,
};

use crate::{
    channel::ByteChannel,
    connection::{Lifecycle, SocketHandle},
};

const IDLE_POLL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 512;

/// Pulls bytes off the current socket and pushes them into the [`ByteChannel`].
pub(crate) struct ByteReader {
    socket: SocketHandle,
    channel: Arc<ByteChannel>,
    lifecycle: Arc<Lifecycle>,
    error_budget: u32,
}

impl ByteReader {
    pub(crate) fn new(
        socket: SocketHandle,
        channel: Arc<ByteChannel>,
        lifecycle: Arc<Lifecycle>,
        error_budget: u32,
    ) -> Self {
        Self {
            socket,
            channel,
            lifecycle,
            error_budget,
        }
    }

    /// Run until a stop is requested or the error budget is exhausted.
    ///
    /// Each read is bounded by the socket timeout, so a stop request or a replaced socket is
    /// noticed within one timeout interval.
    pub(crate) fn run(mut self) {
        let mut buf = [0u8; READ_CHUNK];
        while !self.lifecycle.should_stop() {
            let Some(stream) = self.socket.load() else {
                thread::sleep(IDLE_POLL);
                continue;
            };

            let err = match (&*stream).read(&mut buf) {
                Ok(0) => std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "gateway closed the connection",
                ),
                Ok(n) => {
                    self.channel.push(&buf[..n]);
                    continue;
                }
                Err(err) if is_transient(&err) => continue,
                Err(err) => err,
            };

            if self.lifecycle.should_stop() {
                break;
            }
            self.error_budget = self.error_budget.saturating_sub(1);
            tracing::warn!(
                error = %err,
                remaining_budget = self.error_budget,
                "Error while reading from gateway"
            );
            if self.error_budget == 0 {
                self.lifecycle
                    .fail(format!("reader error budget exhausted, last error: {err}"));
                break;
            }
        }
        tracing::debug!("Byte reader stopped");
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}
