//! GpibRs: Talk to your GPIB instruments through an Ethernet to GPIB gateway
//!
//! The GpibRs library drives a Prologix-style Ethernet to GPIB controller. The gateway speaks a
//! simple ASCII protocol over TCP: lines starting with `++` configure the gateway itself, all
//! other (escaped) bytes are forwarded to the currently addressed instrument. GpibRs takes care of
//! keeping this connection alive, framing and escaping the bytes, addressing the correct
//! instrument for every operation, and bounding every blocking call by a deadline.
//!
//! # Architecture
//!
//! A [`PrologixController`] owns one TCP connection to the gateway. Behind the scenes it runs
//! three threads:
//! - a connection manager that opens the socket and pre-arms the gateway,
//! - a byte reader that drains the socket into an internal byte queue,
//! - a single command worker that processes one [`Command`] at a time.
//!
//! Instruments are accessed via a [`GpibDevice`], which can be cloned cheaply and sent to other
//! threads. Every device operation comes in three flavours: `generate_*_command` builds a
//! [`Command`] without sending it, `*_async` submits it and returns a [`PendingCommand`], and the
//! plain method submits it and blocks until the result is available or the timeout elapsed.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use gpibrs::{GpibAddress, PrologixController};
//!
//! let controller = PrologixController::connect("192.168.10.20").unwrap();
//! let counter = controller.device(GpibAddress::try_new(3, 0).unwrap());
//!
//! println!("Counter name: {}", counter.query("*IDN?").unwrap());
//! let status = counter.serial_poll(Duration::from_secs(1)).unwrap();
//! println!("Status byte: {status:#04x}");
//! ```
//!
//! # Testing
//!
//! Drivers built on top of GpibRs can be tested without hardware using the [`LoopbackGateway`],
//! a scripted gateway that listens on localhost and checks every byte the controller sends.
//!
//! # License
//!
//! Licensed under either of
//!
//! - Apache License, Version 2.0 ([LICENSE-APACHE](http://www.apache.org/licenses/LICENSE-2.0))
//! - MIT license ([LICENSE-MIT](http://opensource.org/licenses/MIT))
//!
//! at your option.

#![warn(missing_docs)]

mod address;
mod channel;
mod command;
mod config;
mod connection;
mod controller;
mod deadline;
mod device;
mod framing;
mod loopback;
mod processor;
mod queue;
mod reader;

pub use address::GpibAddress;
pub use command::{
    Command, Operation, ReadlineTermination, RepeatPredicate, Response, Runnable, UserRunnable,
};
pub use config::GatewayConfig;
pub use connection::ServiceState;
pub use controller::PrologixController;
pub use deadline::Deadline;
pub use device::GpibDevice;
pub use framing::cook;
pub use loopback::{Exchange, LoopbackGateway};
pub use processor::BusContext;
pub use queue::{CommandQueue, ListenerId, PendingCommand};

use std::time::Duration;

use thiserror::Error;

/// The error enum for everything that can go wrong while talking to the gateway.
///
/// Every operation returns either its result or a `GpibError`, such that errors propagate nicely
/// with the `?` operator. Use [`GpibError::kind`] if you only care about the class of failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GpibError {
    /// A bus address string could not be parsed. The error contains the offending string.
    #[error("Could not parse GPIB address: {0}")]
    AddressParse(String),
    /// The connection to the gateway could not be established, the gateway could not be
    /// preconfigured, or the connection was lost afterwards. The error contains the reason.
    #[error("Connection to the GPIB gateway failed: {0}")]
    ConnectionFailed(String),
    /// The gateway sent a byte sequence that violates the expected framing, e.g., a carriage
    /// return that is not followed by a line feed where one is required.
    #[error("Malformed data received from the gateway: {0}")]
    Framing(String),
    /// A given integer value is out of the specified range. The error contains the value that was
    /// given, the minimum value that is allowed, and the maximum value that is allowed.
    #[error("Integer value {value} is out of range. Allowed range is [{min}, {max}]")]
    IntValueOutOfRange {
        /// The value that is out of range.
        value: i64,
        /// The minimum value that is allowed.
        min: i64,
        /// The maximum value that is allowed.
        max: i64,
    },
    /// The operation was interrupted, e.g., because the controller was shut down while it was
    /// waiting for data.
    #[error("Operation was interrupted before it could complete.")]
    Interrupted,
    /// Error when an invalid argument is passed to a function. This error contains only an error
    /// message that is intended for the user.
    #[error("{0}")]
    InvalidArgument(String),
    /// Error when reading from/writing to the socket. See [`std::io::Error`] for more details.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A write was attempted while no socket to the gateway is open.
    #[error("Not connected to the GPIB gateway.")]
    NotConnected,
    /// A response could not be interpreted, e.g., a status byte reply that is not numeric. The
    /// error contains the response that was received.
    #[error("Response could not be parsed. Response was: {0}")]
    ResponseParseError(String),
    /// The time budget of an operation was exhausted. The error contains the budget that was set.
    #[error("Timeout occured while waiting for the gateway. Timeout was set to {0:?}.")]
    Timeout(Duration),
    /// The requested operation is not supported in the given context.
    #[error("Operation is not supported: {0}")]
    UnsupportedOperation(String),
}

/// The class of a [`GpibError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket, framing, or protocol errors.
    Io,
    /// A time budget was exhausted.
    Timeout,
    /// Cooperative cancellation.
    Interrupted,
    /// The operation is not supported.
    UnsupportedOperation,
    /// The caller passed an invalid argument.
    InvalidArgument,
}

impl GpibError {
    /// Return the class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GpibError::ConnectionFailed(_)
            | GpibError::Framing(_)
            | GpibError::Io(_)
            | GpibError::NotConnected
            | GpibError::ResponseParseError(_) => ErrorKind::Io,
            GpibError::Timeout(_) => ErrorKind::Timeout,
            GpibError::Interrupted => ErrorKind::Interrupted,
            GpibError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            GpibError::AddressParse(_)
            | GpibError::IntValueOutOfRange { .. }
            | GpibError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }
}
