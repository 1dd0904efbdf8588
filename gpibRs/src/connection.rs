//! Lifecycle of the TCP connection to the gateway.

use std::{
    io::Write,
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::{GatewayConfig, GpibError, framing};

/// State of the connection service of a [`crate::PrologixController`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceState {
    /// The TCP connection is being established.
    Connecting,
    /// The gateway is being configured.
    Preconfiguring,
    /// Connected and ready to process commands.
    Idle,
    /// The connection is being closed.
    Closing,
    /// The connection was closed on request.
    Closed,
    /// The connection failed. Contains the reason.
    Failed(String),
}

impl ServiceState {
    fn is_settled(&self) -> bool {
        !matches!(self, ServiceState::Connecting | ServiceState::Preconfiguring)
    }
}

/// The shared socket slot.
///
/// The socket itself is never mutated through the handle, it is only ever replaced as a whole.
/// Readers take a snapshot of the current socket and keep using that snapshot for one operation.
#[derive(Clone, Debug, Default)]
pub(crate) struct SocketHandle {
    current: Arc<RwLock<Option<Arc<TcpStream>>>>,
}

impl SocketHandle {
    /// Snapshot of the current socket, `None` if disconnected.
    pub(crate) fn load(&self) -> Option<Arc<TcpStream>> {
        self.current.read().clone()
    }

    /// Replace the current socket and return the old one.
    pub(crate) fn replace(&self, socket: Option<Arc<TcpStream>>) -> Option<Arc<TcpStream>> {
        std::mem::replace(&mut *self.current.write(), socket)
    }

    /// Remove the current socket from the handle.
    pub(crate) fn take(&self) -> Option<Arc<TcpStream>> {
        self.replace(None)
    }
}

#[derive(Debug)]
struct LifecycleInner {
    state: ServiceState,
    stop_requested: bool,
}

/// Service state shared between the controller, the connection manager, and the byte reader.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    inner: Mutex<LifecycleInner>,
    changed: Condvar,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LifecycleInner {
                state: ServiceState::Connecting,
                stop_requested: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> ServiceState {
        self.inner.lock().state.clone()
    }

    fn set_state(&self, state: ServiceState) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ServiceState::Failed(_)) {
            return;
        }
        tracing::info!(?state, "Gateway connection state changed");
        inner.state = state;
        drop(inner);
        self.changed.notify_all();
    }

    /// Move to the failed state. A failure is final and is never overwritten.
    pub(crate) fn fail(&self, reason: String) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ServiceState::Failed(_)) {
            return;
        }
        tracing::error!(%reason, "Gateway connection failed");
        inner.state = ServiceState::Failed(reason);
        drop(inner);
        self.changed.notify_all();
    }

    /// The reason of the failure, if the service failed.
    pub(crate) fn failure(&self) -> Option<String> {
        match &self.inner.lock().state {
            ServiceState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    pub(crate) fn request_stop(&self) {
        self.inner.lock().stop_requested = true;
        self.changed.notify_all();
    }

    /// Returns `true` if background loops should terminate.
    pub(crate) fn should_stop(&self) -> bool {
        let inner = self.inner.lock();
        inner.stop_requested || matches!(inner.state, ServiceState::Failed(_))
    }

    /// Block until a stop was requested or the service failed.
    fn wait_for_stop(&self) {
        let mut inner = self.inner.lock();
        while !(inner.stop_requested || matches!(inner.state, ServiceState::Failed(_))) {
            self.changed.wait(&mut inner);
        }
    }

    /// Block until the connection is established or failed, or until `timeout` elapsed.
    pub(crate) fn wait_settled(&self, timeout: Duration) -> ServiceState {
        let until = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.state.is_settled() {
            if self.changed.wait_until(&mut inner, until).timed_out() {
                break;
            }
        }
        inner.state.clone()
    }
}

/// Owns the socket lifecycle: connects, pre-arms the gateway, and closes the socket on request.
pub(crate) struct ConnectionManager {
    config: GatewayConfig,
    socket: SocketHandle,
    lifecycle: Arc<Lifecycle>,
}

impl ConnectionManager {
    pub(crate) fn new(config: GatewayConfig, socket: SocketHandle, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            config,
            socket,
            lifecycle,
        }
    }

    /// Connect, then block until a stop is requested or the connection failed, then close.
    pub(crate) fn run(self) {
        if let Err(err) = self.open() {
            self.lifecycle.fail(err.to_string());
            return;
        }
        self.lifecycle.wait_for_stop();
        self.close();
    }

    fn open(&self) -> Result<(), GpibError> {
        if let Some(stale) = self.socket.take() {
            tracing::warn!("Closing stale gateway socket before reconnecting");
            let _ = stale.shutdown(Shutdown::Both);
        }

        self.lifecycle.set_state(ServiceState::Connecting);
        let stream = self.connect()?;

        self.lifecycle.set_state(ServiceState::Preconfiguring);
        if let Err(err) = preconfigure(&stream) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(err);
        }

        self.socket.replace(Some(Arc::new(stream)));
        self.lifecycle.set_state(ServiceState::Idle);
        Ok(())
    }

    fn connect(&self) -> Result<TcpStream, GpibError> {
        let addr = self.config.socket_addr();
        tracing::debug!(
            addr = %addr,
            timeout_ms = self.config.connect_timeout().as_millis(),
            "Connecting to gateway"
        );

        let mut last_err = None;
        for sock_addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock_addr, self.config.connect_timeout()) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.config.socket_timeout()))?;
                    stream.set_write_timeout(Some(self.config.socket_timeout()))?;
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::warn!(addr = %addr, error = %err, "Failed to disable Nagle");
                    }
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => GpibError::ConnectionFailed(format!("{addr}: {err}")),
            None => GpibError::ConnectionFailed(format!("{addr}: no address resolved")),
        })
    }

    fn close(&self) {
        let failed = self.lifecycle.failure().is_some();
        if !failed {
            self.lifecycle.set_state(ServiceState::Closing);
        }
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if !failed {
            self.lifecycle.set_state(ServiceState::Closed);
        }
    }
}

/// Send the meta-commands that put the gateway into a known state.
pub(crate) fn preconfigure(mut stream: &TcpStream) -> Result<(), GpibError> {
    for cmd in framing::PRECONFIGURE {
        tracing::debug!(cmd, "Preconfiguring gateway");
        stream.write_all(&framing::meta_line(cmd))?;
    }
    stream.flush()?;
    Ok(())
}
