//! The gateway controller: owns the connection, the byte reader, and the command worker.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    Command, CommandQueue, GatewayConfig, GpibAddress, GpibDevice, GpibError, Operation,
    ServiceState,
    channel::ByteChannel,
    connection::{ConnectionManager, Lifecycle, SocketHandle},
    framing::Framing,
    processor::CommandProcessor,
    reader::ByteReader,
};

/// A connection to a Prologix-style Ethernet to GPIB gateway.
///
/// Starting a controller connects to the gateway and preconfigures it. Afterwards, devices on the
/// bus are accessed through [`GpibDevice`] handles created with [`PrologixController::device`].
/// The controller shuts down when it is dropped; devices that outlive it fail with
/// [`GpibError::Interrupted`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use gpibrs::{GatewayConfig, PrologixController};
///
/// let config = GatewayConfig::new("192.168.10.20").with_default_timeout(Duration::from_secs(5));
/// let controller = PrologixController::start(config).unwrap();
/// println!("Gateway: {}", controller.controller_version(Duration::from_secs(1)).unwrap());
/// ```
pub struct PrologixController {
    config: GatewayConfig,
    lifecycle: Arc<Lifecycle>,
    channel: Arc<ByteChannel>,
    queue: Arc<CommandQueue>,
    manager: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl PrologixController {
    /// Connect to the gateway at `host` or `host:port` with the default configuration.
    pub fn connect(addr: &str) -> Result<Self, GpibError> {
        Self::start(GatewayConfig::from_addr(addr)?)
    }

    /// Connect to and preconfigure the gateway, then start the background threads.
    ///
    /// Returns [`GpibError::ConnectionFailed`] if the gateway cannot be reached or configured.
    pub fn start(config: GatewayConfig) -> Result<Self, GpibError> {
        tracing::info!(addr = %config.socket_addr(), "Starting GPIB gateway controller");
        let lifecycle = Arc::new(Lifecycle::new());
        let socket = SocketHandle::default();

        let manager = {
            let manager =
                ConnectionManager::new(config.clone(), socket.clone(), Arc::clone(&lifecycle));
            thread::Builder::new()
                .name("gpib-connection".to_string())
                .spawn(move || manager.run())?
        };

        let settle = config.connect_timeout() + 2 * config.socket_timeout();
        match lifecycle.wait_settled(settle) {
            ServiceState::Idle => {}
            ServiceState::Failed(reason) => {
                join(manager, "connection manager");
                return Err(GpibError::ConnectionFailed(reason));
            }
            state => {
                lifecycle.request_stop();
                join(manager, "connection manager");
                return Err(GpibError::ConnectionFailed(format!(
                    "gateway did not become ready within {settle:?}, state was {state:?}"
                )));
            }
        }

        let channel = Arc::new(ByteChannel::new(config.channel_warn_threshold()));
        let framing = Framing::new(
            Arc::clone(&channel),
            socket.clone(),
            config.eot_char(),
            config.eoi_linger(),
        );
        let processor = CommandProcessor::new(framing, Arc::clone(&lifecycle));

        let controller = Self {
            queue: Arc::new(CommandQueue::spawn(processor)?),
            config: config.clone(),
            lifecycle: Arc::clone(&lifecycle),
            channel: Arc::clone(&channel),
            manager: Mutex::new(Some(manager)),
            reader: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        };

        let reader = ByteReader::new(
            socket,
            channel,
            lifecycle,
            config.reader_error_budget(),
        );
        let reader = thread::Builder::new()
            .name("gpib-byte-reader".to_string())
            .spawn(move || reader.run())?;
        *controller.reader.lock() = Some(reader);

        Ok(controller)
    }

    /// A handle to the device at the given address.
    ///
    /// Its synchronous operations use the default timeout of the configuration unless another
    /// one is passed.
    pub fn device(&self, address: GpibAddress) -> GpibDevice {
        GpibDevice::new(
            address,
            Arc::clone(&self.queue),
            self.config.default_timeout(),
        )
    }

    /// The configuration this controller was started with.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The current state of the connection service.
    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    /// The command queue, e.g., to register completion listeners.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Query the firmware version string of the gateway.
    pub fn controller_version(&self, timeout: Duration) -> Result<String, GpibError> {
        self.queue
            .submit(Command::controller(Operation::ControllerVersion), timeout)?
            .wait()?
            .into_text()
    }

    /// Send the preconfiguration to the gateway again, e.g., after it was power cycled.
    pub fn reset_controller(&self, timeout: Duration) -> Result<(), GpibError> {
        self.queue
            .submit(Command::controller(Operation::ResetController), timeout)?
            .wait()?
            .into_done()
    }

    /// Round trip through the command queue without touching the bus.
    pub fn no_op(&self, timeout: Duration) -> Result<(), GpibError> {
        self.queue
            .submit(Command::controller(Operation::NoOp), timeout)?
            .wait()?
            .into_done()
    }

    /// Stop all background threads and close the connection.
    ///
    /// Commands still waiting in the queue complete with [`GpibError::Interrupted`]. Calling this
    /// more than once has no further effect.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(addr = %self.config.socket_addr(), "Shutting down GPIB gateway controller");

        self.lifecycle.request_stop();
        self.channel.close();
        self.queue.close();
        if let Some(manager) = self.manager.lock().take() {
            join(manager, "connection manager");
        }
        if let Some(reader) = self.reader.lock().take() {
            join(reader, "byte reader");
        }
    }
}

impl Drop for PrologixController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join(handle: JoinHandle<()>, name: &str) {
    if handle.join().is_err() {
        tracing::error!(thread = name, "Background thread panicked");
    }
}
