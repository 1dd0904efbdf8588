//! Low-level framing primitives: timeout-bounded reads from the byte channel and raw, cooked, and
//! meta-command writes to the gateway socket.

use std::{io::Write, sync::Arc, time::Duration};

use crate::{
    Deadline, GpibError, ReadlineTermination,
    channel::ByteChannel,
    connection::SocketHandle,
};

const LF: u8 = 0x0A;
const CR: u8 = 0x0D;
const ESC: u8 = 0x1B;
const PLUS: u8 = 0x2B;

/// Meta-commands that put the gateway into a known state, in the order they must be sent.
///
/// Controller mode, interface clear, assert EOI with the last byte of every write, do not append
/// any termination characters, do not send EOT bytes, and no automatic read-after-write.
pub(crate) const PRECONFIGURE: [&str; 6] = [
    "++mode 1",
    "++ifc",
    "++eoi 1",
    "++eos 3",
    "++eot_enable 0",
    "++auto 0",
];

/// Escape device payload bytes and append the unescaped LF that terminates a gateway command.
///
/// Every LF, CR, ESC, and `+` in the payload is prefixed by an ESC byte, such that the gateway
/// forwards it to the device instead of interpreting it.
///
/// ```
/// assert_eq!(gpibrs::cook(&[0x0A]), vec![0x1B, 0x0A, 0x0A]);
/// assert_eq!(gpibrs::cook(b"*IDN?"), b"*IDN?\n".to_vec());
/// ```
pub fn cook(data: &[u8]) -> Vec<u8> {
    let mut cooked = Vec::with_capacity(data.len() + data.len() / 4 + 1);
    for &byte in data {
        if matches!(byte, LF | CR | ESC | PLUS) {
            cooked.push(ESC);
        }
        cooked.push(byte);
    }
    cooked.push(LF);
    cooked
}

/// A gateway meta-command as it goes on the wire: never escaped, LF terminated.
pub(crate) fn meta_line(cmd: &str) -> Vec<u8> {
    let mut line = Vec::with_capacity(cmd.len() + 1);
    line.extend_from_slice(cmd.as_bytes());
    line.push(LF);
    line
}

/// Render bytes for log output, escaping everything that is not printable ASCII.
pub(crate) fn escape_bytes(data: &[u8]) -> String {
    data.iter()
        .flat_map(|&b| std::ascii::escape_default(b))
        .map(char::from)
        .collect()
}

/// What a [`LineScanner`] made of the byte it was fed.
#[derive(Debug, PartialEq)]
enum Scan {
    More,
    Done,
}

/// Terminator detection for line-oriented reads.
///
/// The scanner keeps the full byte run including the terminator, such that it can be logged, and
/// strips the terminator once the line is complete.
#[derive(Debug)]
struct LineScanner {
    mode: ReadlineTermination,
    raw: Vec<u8>,
    pending: bool,
}

impl LineScanner {
    fn new(mode: ReadlineTermination) -> Self {
        Self {
            mode,
            raw: Vec::new(),
            pending: false,
        }
    }

    fn feed(&mut self, byte: u8) -> Result<Scan, GpibError> {
        use ReadlineTermination::*;

        self.raw.push(byte);
        if self.pending {
            // Only the two byte terminators pend.
            let expected = if self.mode == LfCr { CR } else { LF };
            return if byte == expected {
                Ok(Scan::Done)
            } else {
                Err(self.malformed())
            };
        }

        match (self.mode, byte) {
            (Lf, LF) | (Cr, CR) | (OptCrLf, LF) => Ok(Scan::Done),
            (CrLf | OptCrLf, CR) | (LfCr, LF) => {
                self.pending = true;
                Ok(Scan::More)
            }
            (CrLf, LF) | (LfCr, CR) => Err(self.malformed()),
            _ => Ok(Scan::More),
        }
    }

    fn malformed(&self) -> GpibError {
        GpibError::Framing(format!(
            "unexpected terminator sequence for {:?} line: {}",
            self.mode,
            escape_bytes(&self.raw)
        ))
    }

    fn into_line(mut self) -> Vec<u8> {
        let terminator_len = if self.pending { 2 } else { 1 };
        let len = self.raw.len().saturating_sub(terminator_len);
        self.raw.truncate(len);
        self.raw
    }
}

/// Timeout-bounded read and write primitives on top of the byte channel and the gateway socket.
#[derive(Debug)]
pub(crate) struct Framing {
    channel: Arc<ByteChannel>,
    socket: SocketHandle,
    eot_char: u8,
    eoi_linger: Duration,
}

impl Framing {
    pub(crate) fn new(
        channel: Arc<ByteChannel>,
        socket: SocketHandle,
        eot_char: u8,
        eoi_linger: Duration,
    ) -> Self {
        Self {
            channel,
            socket,
            eot_char,
            eoi_linger,
        }
    }

    pub(crate) fn eot_char(&self) -> u8 {
        self.eot_char
    }

    /// Drop stale bytes that are still buffered, returns the number of dropped bytes.
    pub(crate) fn clear(&self) -> usize {
        let dropped = self.channel.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded stale bytes from gateway");
        }
        dropped
    }

    /// Read the next byte or fail with a timeout once the deadline passed.
    pub(crate) fn read_byte(&self, deadline: Deadline) -> Result<u8, GpibError> {
        deadline.check()?;
        self.channel
            .pop_until(deadline.instant())?
            .ok_or_else(|| deadline.timeout_error())
    }

    /// Read one line and strip its terminator.
    pub(crate) fn read_line(
        &self,
        mode: ReadlineTermination,
        deadline: Deadline,
    ) -> Result<Vec<u8>, GpibError> {
        let mut scanner = LineScanner::new(mode);
        loop {
            let byte = match self.read_byte(deadline) {
                Ok(byte) => byte,
                Err(err) => {
                    log_partial("read_line", &scanner.raw, &err);
                    return Err(err);
                }
            };
            match scanner.feed(byte) {
                Ok(Scan::More) => {}
                Ok(Scan::Done) => break,
                Err(err) => {
                    log_partial("read_line", &scanner.raw, &err);
                    return Err(err);
                }
            }
        }
        tracing::trace!(?mode, bytes = %escape_bytes(&scanner.raw), "Read line");
        Ok(scanner.into_line())
    }

    /// Read until the gateway's EOT byte marks the end of a transfer.
    ///
    /// The EOT byte can also be ordinary device data. After an EOT byte the read lingers for a
    /// short window: if nothing else arrives the EOT byte terminated the transfer, otherwise it
    /// was data and scanning continues with the byte that arrived.
    pub(crate) fn read_eoi(&self, deadline: Deadline) -> Result<Vec<u8>, GpibError> {
        let mut data = Vec::new();
        let mut next = None;
        loop {
            let byte = match next.take() {
                Some(byte) => byte,
                None => match self.read_byte(deadline) {
                    Ok(byte) => byte,
                    Err(err) => {
                        log_partial("read_eoi", &data, &err);
                        return Err(err);
                    }
                },
            };
            if byte != self.eot_char {
                data.push(byte);
                continue;
            }

            let linger = deadline.shortened(self.eoi_linger);
            match self.channel.pop_until(linger.instant()) {
                Ok(None) => break,
                Ok(Some(following)) => {
                    data.push(byte);
                    next = Some(following);
                }
                Err(err) => {
                    log_partial("read_eoi", &data, &err);
                    return Err(err);
                }
            }
        }
        tracing::trace!(
            bytes = %escape_bytes(&data),
            eot = self.eot_char,
            "Read until EOI"
        );
        Ok(data)
    }

    /// Read exactly `count` bytes.
    pub(crate) fn read_n(&self, count: usize, deadline: Deadline) -> Result<Vec<u8>, GpibError> {
        let mut data = Vec::with_capacity(count);
        while data.len() < count {
            match self.read_byte(deadline) {
                Ok(byte) => data.push(byte),
                Err(err) => {
                    log_partial("read_n", &data, &err);
                    return Err(err);
                }
            }
        }
        tracing::trace!(count, bytes = %escape_bytes(&data), "Read bytes");
        Ok(data)
    }

    /// Write bytes to the gateway without any modification.
    pub(crate) fn write_raw(&self, data: &[u8]) -> Result<(), GpibError> {
        let stream = self.socket.load().ok_or(GpibError::NotConnected)?;
        let mut stream = &*stream;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

    /// Escape device payload, terminate it, and write it to the gateway.
    pub(crate) fn cook_and_write(&self, data: &[u8]) -> Result<(), GpibError> {
        tracing::debug!(bytes = %escape_bytes(data), "Writing to device");
        self.write_raw(&cook(data))
    }

    /// Write a gateway meta-command, e.g., `++addr 5`.
    pub(crate) fn write_meta(&self, cmd: &str) -> Result<(), GpibError> {
        tracing::debug!(cmd, "Sending gateway command");
        self.write_raw(&meta_line(cmd))
    }
}

fn log_partial(op: &str, data: &[u8], err: &GpibError) {
    tracing::debug!(
        op,
        partial = %escape_bytes(data),
        error = %err,
        "Read failed after partial data"
    );
}
