//! Command descriptors and their results.
//!
//! A [`Command`] describes one operation on the bus. It is built by a [`crate::GpibDevice`] (or
//! by hand), submitted once to the [`crate::CommandQueue`], and processed exactly once. The
//! result of the processing is a [`Response`] or a [`crate::GpibError`].

use std::{fmt, sync::Arc};

use crate::{BusContext, GpibAddress, GpibError};

/// Termination of line-oriented reads.
///
/// The terminator bytes are never part of the returned line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadlineTermination {
    /// Lines end with a carriage return.
    Cr,
    /// Lines end with a line feed.
    Lf,
    /// Lines end with a carriage return followed by a line feed. Any other CR or LF is malformed.
    CrLf,
    /// Lines end with a line feed that can be preceded by a carriage return. A carriage return
    /// that is not followed by a line feed is malformed.
    OptCrLf,
    /// Lines end with a line feed followed by a carriage return. Any other LF or CR is malformed.
    LfCr,
}

impl ReadlineTermination {
    /// The character the gateway reads up to, as argument to `++read`.
    pub(crate) fn read_arg(&self) -> &'static str {
        match self {
            ReadlineTermination::Cr | ReadlineTermination::LfCr => "13",
            ReadlineTermination::Lf | ReadlineTermination::CrLf | ReadlineTermination::OptCrLf => {
                "10"
            }
        }
    }
}

/// Code that runs on the command worker inside the addressed context of a device.
///
/// Closures of the form `Fn(&mut BusContext<'_>) -> Result<Response, GpibError>` implement this
/// trait. Implement it yourself for more complex, stateful procedures.
pub trait UserRunnable: Send + Sync {
    /// Run the procedure.
    fn run(&self, bus: &mut BusContext<'_>) -> Result<Response, GpibError>;
}

impl<F> UserRunnable for F
where
    F: Fn(&mut BusContext<'_>) -> Result<Response, GpibError> + Send + Sync,
{
    fn run(&self, bus: &mut BusContext<'_>) -> Result<Response, GpibError> {
        self(bus)
    }
}

/// Shared handle to a [`UserRunnable`].
#[derive(Clone)]
pub struct Runnable(Arc<dyn UserRunnable>);

impl Runnable {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut BusContext<'_>) -> Result<Response, GpibError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap any implementation of [`UserRunnable`].
    pub fn from_arc(runnable: Arc<dyn UserRunnable>) -> Self {
        Self(runnable)
    }

    pub(crate) fn run(&self, bus: &mut BusContext<'_>) -> Result<Response, GpibError> {
        self.0.run(bus)
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Runnable(..)")
    }
}

/// Decides whether an atomic repeat is done, given the outcome of the last repetition.
#[derive(Clone)]
pub struct RepeatPredicate(Arc<dyn Fn(&Result<Response, GpibError>) -> bool + Send + Sync>);

impl RepeatPredicate {
    /// Create a predicate from a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Result<Response, GpibError>) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Evaluate the predicate.
    pub fn test(&self, outcome: &Result<Response, GpibError>) -> bool {
        (self.0)(outcome)
    }
}

impl fmt::Debug for RepeatPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RepeatPredicate(..)")
    }
}

/// The operations the command processor understands.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Operation {
    /// Do nothing.
    NoOp,
    /// Re-send the gateway preconfiguration. Not allowed inside atomic operations.
    ResetController,
    /// Query the gateway firmware version.
    ControllerVersion,
    /// Selected device clear of the addressed device.
    SelectedDeviceClear,
    /// Group execute trigger of the addressed device.
    Trigger,
    /// Return the addressed device to local control.
    GoToLocal,
    /// Serial poll the addressed device and return its status byte.
    SerialPoll,
    /// Check whether the addressed device requests service.
    PollServiceRequest,
    /// Read until EOI.
    ReadEoi,
    /// Read exactly the given number of bytes.
    ReadN(usize),
    /// Read one line.
    ReadLine(ReadlineTermination),
    /// Write the bytes.
    Write(Vec<u8>),
    /// Write the bytes, then read until EOI.
    WriteReadEoi(Vec<u8>),
    /// Write the bytes, then read exactly the given number of bytes.
    WriteReadN(Vec<u8>, usize),
    /// Write the bytes, then read one line.
    WriteReadLine(Vec<u8>, ReadlineTermination),
    /// Write the bytes, then read the given number of lines.
    WriteReadLineN(Vec<u8>, ReadlineTermination, usize),
    /// Run the commands in order without anything else happening on the bus in between.
    AtomicSequence(Vec<Command>),
    /// Repeat a command until the predicate accepts its outcome or the deadline passed.
    AtomicRepeatUntil {
        /// The command to repeat.
        command: Option<Box<Command>>,
        /// The stop condition.
        until: RepeatPredicate,
    },
    /// Run user code in the addressed context.
    UserRunnable(Runnable),
}

impl Operation {
    /// A short name for log output.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::NoOp => "no-op",
            Operation::ResetController => "reset-controller",
            Operation::ControllerVersion => "controller-version",
            Operation::SelectedDeviceClear => "selected-device-clear",
            Operation::Trigger => "trigger",
            Operation::GoToLocal => "go-to-local",
            Operation::SerialPoll => "serial-poll",
            Operation::PollServiceRequest => "poll-service-request",
            Operation::ReadEoi => "read-eoi",
            Operation::ReadN(_) => "read-n",
            Operation::ReadLine(_) => "read-line",
            Operation::Write(_) => "write",
            Operation::WriteReadEoi(_) => "write-read-eoi",
            Operation::WriteReadN(..) => "write-read-n",
            Operation::WriteReadLine(..) => "write-read-line",
            Operation::WriteReadLineN(..) => "write-read-line-n",
            Operation::AtomicSequence(_) => "atomic-sequence",
            Operation::AtomicRepeatUntil { .. } => "atomic-repeat-until",
            Operation::UserRunnable(_) => "user-runnable",
        }
    }
}

/// One operation on the bus, optionally targeted at a device.
#[derive(Clone, Debug)]
pub struct Command {
    target: Option<GpibAddress>,
    operation: Operation,
}

impl Command {
    /// Create a command for the device at the given address.
    pub fn new(target: GpibAddress, operation: Operation) -> Self {
        Self {
            target: Some(target),
            operation,
        }
    }

    /// Create a command for the gateway itself, which does not address any device.
    pub fn controller(operation: Operation) -> Self {
        Self {
            target: None,
            operation,
        }
    }

    /// The address of the target device, if any.
    pub fn target(&self) -> Option<GpibAddress> {
        self.target
    }

    /// The operation.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

/// The result of a successfully processed [`Command`].
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The operation completed and has no result.
    Done,
    /// A serial poll status byte.
    StatusByte(u8),
    /// Whether the device requested service.
    ServiceRequest(bool),
    /// Bytes read from the device.
    Bytes(Vec<u8>),
    /// Lines read from the device, terminators stripped.
    Lines(Vec<Vec<u8>>),
    /// Text returned by the gateway.
    Text(String),
    /// Results of the commands of an atomic sequence, in order.
    Sequence(Vec<Response>),
}

impl Response {
    fn unexpected(self, what: &str) -> GpibError {
        GpibError::ResponseParseError(format!("expected {what}, got {self:?}"))
    }

    /// Expect [`Response::Done`].
    pub fn into_done(self) -> Result<(), GpibError> {
        match self {
            Response::Done => Ok(()),
            other => Err(other.unexpected("no result")),
        }
    }

    /// Expect a status byte.
    pub fn into_status_byte(self) -> Result<u8, GpibError> {
        match self {
            Response::StatusByte(stb) => Ok(stb),
            other => Err(other.unexpected("a status byte")),
        }
    }

    /// Expect a service request flag.
    pub fn into_service_request(self) -> Result<bool, GpibError> {
        match self {
            Response::ServiceRequest(srq) => Ok(srq),
            other => Err(other.unexpected("a service request flag")),
        }
    }

    /// Expect bytes.
    pub fn into_bytes(self) -> Result<Vec<u8>, GpibError> {
        match self {
            Response::Bytes(data) => Ok(data),
            other => Err(other.unexpected("bytes")),
        }
    }

    /// Expect lines.
    pub fn into_lines(self) -> Result<Vec<Vec<u8>>, GpibError> {
        match self {
            Response::Lines(lines) => Ok(lines),
            other => Err(other.unexpected("lines")),
        }
    }

    /// Expect text.
    pub fn into_text(self) -> Result<String, GpibError> {
        match self {
            Response::Text(text) => Ok(text),
            other => Err(other.unexpected("text")),
        }
    }

    /// Expect the results of an atomic sequence.
    pub fn into_sequence(self) -> Result<Vec<Response>, GpibError> {
        match self {
            Response::Sequence(results) => Ok(results),
            other => Err(other.unexpected("a sequence")),
        }
    }
}
