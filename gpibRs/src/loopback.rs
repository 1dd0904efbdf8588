//! A scripted gateway for testing code that talks to GPIB devices without any hardware.
//!
//! The [`LoopbackGateway`] listens on localhost and accepts exactly one connection. It then plays
//! a script of [`Exchange`]s: it expects the exact bytes the controller must send, and answers
//! with the bytes the device would return.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use gpibrs::{Exchange, GpibAddress, LoopbackGateway, PrologixController};
//!
//! let gateway = LoopbackGateway::with_preconfigure(vec![
//!     Exchange::host("++addr 5"),
//!     Exchange::host("++eot_enable 0"),
//!     Exchange::host("*IDN?"),
//!     Exchange::host("++read 10"),
//!     Exchange::inst(b"ACME,42\r\n"),
//! ]);
//!
//! let controller = PrologixController::start(gateway.config()).unwrap();
//! let inst = controller.device(GpibAddress::try_new(5, 0).unwrap());
//! assert_eq!(inst.query("*IDN?").unwrap(), "ACME,42");
//! ```

use std::{
    io::{ErrorKind, Read, Write},
    net::{TcpListener, TcpStream},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{GatewayConfig, framing};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
const HOST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// One step of a [`LoopbackGateway`] script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exchange {
    /// Bytes the gateway expects from the host, exactly.
    Host(Vec<u8>),
    /// Bytes the gateway sends to the host, as if they came from the device.
    Inst(Vec<u8>),
    /// Wait before the next step.
    Pause(Duration),
}

impl Exchange {
    /// Expect one line from the host. The terminating line feed is appended.
    pub fn host(line: &str) -> Self {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        Exchange::Host(bytes)
    }

    /// Expect raw bytes from the host, e.g., an escaped payload.
    pub fn host_bytes(bytes: &[u8]) -> Self {
        Exchange::Host(bytes.to_vec())
    }

    /// Send bytes to the host.
    pub fn inst(bytes: &[u8]) -> Self {
        Exchange::Inst(bytes.to_vec())
    }

    /// Pause for the given duration.
    pub fn pause(duration: Duration) -> Self {
        Exchange::Pause(duration)
    }

    /// The meta-commands every controller sends right after connecting.
    pub fn preconfigure() -> Vec<Self> {
        framing::PRECONFIGURE
            .iter()
            .map(|cmd| Exchange::host(cmd))
            .collect()
    }
}

/// A scripted gateway on `127.0.0.1` for tests.
///
/// Call [`LoopbackGateway::finalize`] at the end of the test, after shutting down the controller,
/// to make sure that the script ran to its end and nothing unexpected was sent. Dropping the
/// gateway finalizes it as well.
pub struct LoopbackGateway {
    port: u16,
    script: Option<JoinHandle<Result<(), String>>>,
}

impl LoopbackGateway {
    /// Start a gateway that plays the given script.
    ///
    /// # Panics
    /// Panics if no local port can be bound.
    pub fn new(script: Vec<Exchange>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Could not bind a local port.");
        let port = listener
            .local_addr()
            .expect("Local port has no address.")
            .port();
        let script = thread::Builder::new()
            .name("gpib-loopback-gateway".to_string())
            .spawn(move || play(listener, script))
            .expect("Could not spawn the loopback gateway thread.");
        Self {
            port,
            script: Some(script),
        }
    }

    /// Start a gateway that first expects the preconfiguration, then plays the given script.
    pub fn with_preconfigure(script: Vec<Exchange>) -> Self {
        let mut full = Exchange::preconfigure();
        full.extend(script);
        Self::new(full)
    }

    /// The port the gateway listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// A controller configuration for this gateway, with short timeouts.
    pub fn config(&self) -> GatewayConfig {
        GatewayConfig::new("127.0.0.1")
            .with_port(self.port)
            .with_connect_timeout(Duration::from_secs(1))
            .with_socket_timeout(Duration::from_millis(100))
    }

    /// Wait for the script to end and panic if it failed.
    ///
    /// # Panics
    /// Panics if the host sent anything other than the scripted bytes, or if the script did not
    /// run to its end.
    pub fn finalize(&mut self) {
        let Some(script) = self.script.take() else {
            return;
        };
        match script.join() {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => panic!("Loopback gateway script failed: {msg}"),
            Err(_) => panic!("Loopback gateway thread panicked."),
        }
    }
}

impl Drop for LoopbackGateway {
    fn drop(&mut self) {
        if !thread::panicking() {
            self.finalize();
        }
    }
}

fn accept(listener: &TcpListener) -> Result<TcpStream, String> {
    listener.set_nonblocking(true).map_err(|e| e.to_string())?;
    let start = Instant::now();
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).map_err(|e| e.to_string())?;
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if start.elapsed() > ACCEPT_TIMEOUT {
                    return Err("no host connected".to_string());
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(e.to_string()),
        }
    }
}

fn play(listener: TcpListener, script: Vec<Exchange>) -> Result<(), String> {
    let mut stream = accept(&listener)?;
    stream
        .set_read_timeout(Some(HOST_READ_TIMEOUT))
        .map_err(|e| e.to_string())?;

    for (step, exchange) in script.into_iter().enumerate() {
        match exchange {
            Exchange::Host(expected) => {
                let mut received = vec![0u8; expected.len()];
                stream.read_exact(&mut received).map_err(|e| {
                    format!(
                        "step {step}: waiting for '{}' from host: {e}",
                        framing::escape_bytes(&expected)
                    )
                })?;
                if received != expected {
                    return Err(format!(
                        "step {step}: expected '{}' from host, got '{}'",
                        framing::escape_bytes(&expected),
                        framing::escape_bytes(&received)
                    ));
                }
            }
            Exchange::Inst(data) => {
                stream
                    .write_all(&data)
                    .map_err(|e| format!("step {step}: writing to host: {e}"))?;
            }
            Exchange::Pause(duration) => thread::sleep(duration),
        }
    }

    // Anything the host sends after the script ended is unexpected.
    let mut trailing = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => trailing.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => break,
            Err(e) => return Err(e.to_string()),
        }
    }
    if !trailing.is_empty() {
        return Err(format!(
            "unexpected bytes from host after the script ended: '{}'",
            framing::escape_bytes(&trailing)
        ));
    }
    Ok(())
}
