//! Device facade: commands for one address on the bus.
//!
//! Every operation comes in three forms:
//! - `generate_*_command` builds the [`Command`] without submitting it, e.g., to compose an
//!   atomic sequence,
//! - `*_async` submits the command with the default timeout of the device and returns a
//!   [`PendingCommand`] right away,
//! - the plain method submits the command and blocks until its typed result is available or the
//!   given timeout elapsed.

use std::{sync::Arc, time::Duration};

use crate::{
    Command, CommandQueue, GpibAddress, GpibError, Operation, PendingCommand, ReadlineTermination,
    RepeatPredicate, Response, Runnable,
};

/// A device on the bus, reachable through a [`crate::PrologixController`].
///
/// Devices are cheap to clone and can be moved to other threads. All operations of all devices
/// of one controller are processed one after the other.
#[derive(Clone)]
pub struct GpibDevice {
    address: GpibAddress,
    queue: Arc<CommandQueue>,
    timeout: Duration,
}

impl GpibDevice {
    pub(crate) fn new(address: GpibAddress, queue: Arc<CommandQueue>, timeout: Duration) -> Self {
        Self {
            address,
            queue,
            timeout,
        }
    }

    /// The bus address of the device.
    pub fn address(&self) -> GpibAddress {
        self.address
    }

    /// The timeout used by the `*_async` methods, [`GpibDevice::sendcmd`], and
    /// [`GpibDevice::query`].
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the default timeout of this handle.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn command(&self, operation: Operation) -> Command {
        Command::new(self.address, operation)
    }

    fn submit(&self, command: Command) -> Result<PendingCommand, GpibError> {
        self.queue.submit(command, self.timeout)
    }

    fn execute(&self, command: Command, timeout: Duration) -> Result<Response, GpibError> {
        self.queue.submit(command, timeout)?.wait()
    }

    /// Send a string command to the device.
    pub fn sendcmd(&self, cmd: &str) -> Result<(), GpibError> {
        self.write(cmd.as_bytes(), self.timeout)
    }

    /// Send a string query and return the reply line, trimmed.
    ///
    /// The reply ends with a line feed, optionally preceded by a carriage return. Invalid UTF-8 is
    /// replaced.
    pub fn query(&self, cmd: &str) -> Result<String, GpibError> {
        let line = self.write_read_line(cmd.as_bytes(), ReadlineTermination::OptCrLf, self.timeout)?;
        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }

    // Selected device clear

    /// Build a selected device clear command.
    pub fn generate_selected_device_clear_command(&self) -> Command {
        self.command(Operation::SelectedDeviceClear)
    }

    /// Submit a selected device clear.
    pub fn selected_device_clear_async(&self) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_selected_device_clear_command())
    }

    /// Reset the device's message exchange with a selected device clear.
    pub fn selected_device_clear(&self, timeout: Duration) -> Result<(), GpibError> {
        self.execute(self.generate_selected_device_clear_command(), timeout)?
            .into_done()
    }

    // Trigger

    /// Build a group execute trigger command.
    pub fn generate_trigger_command(&self) -> Command {
        self.command(Operation::Trigger)
    }

    /// Submit a group execute trigger.
    pub fn trigger_async(&self) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_trigger_command())
    }

    /// Trigger the device.
    pub fn trigger(&self, timeout: Duration) -> Result<(), GpibError> {
        self.execute(self.generate_trigger_command(), timeout)?
            .into_done()
    }

    // Go to local

    /// Build a go-to-local command.
    pub fn generate_go_to_local_command(&self) -> Command {
        self.command(Operation::GoToLocal)
    }

    /// Submit a go-to-local.
    pub fn go_to_local_async(&self) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_go_to_local_command())
    }

    /// Return the device to front panel control.
    pub fn go_to_local(&self, timeout: Duration) -> Result<(), GpibError> {
        self.execute(self.generate_go_to_local_command(), timeout)?
            .into_done()
    }

    // Serial poll

    /// Build a serial poll command.
    pub fn generate_serial_poll_command(&self) -> Command {
        self.command(Operation::SerialPoll)
    }

    /// Submit a serial poll.
    pub fn serial_poll_async(&self) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_serial_poll_command())
    }

    /// Serial poll the device and return its status byte.
    pub fn serial_poll(&self, timeout: Duration) -> Result<u8, GpibError> {
        self.execute(self.generate_serial_poll_command(), timeout)?
            .into_status_byte()
    }

    // Service request

    /// Build a service request poll command.
    pub fn generate_poll_service_request_command(&self) -> Command {
        self.command(Operation::PollServiceRequest)
    }

    /// Submit a service request poll.
    pub fn poll_service_request_async(&self) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_poll_service_request_command())
    }

    /// Returns `true` if this device requests service.
    ///
    /// The device is only serial polled if some device on the bus asserts SRQ.
    pub fn poll_service_request(&self, timeout: Duration) -> Result<bool, GpibError> {
        self.execute(self.generate_poll_service_request_command(), timeout)?
            .into_service_request()
    }

    // Reads

    /// Build a command that reads until EOI.
    pub fn generate_read_eoi_command(&self) -> Command {
        self.command(Operation::ReadEoi)
    }

    /// Submit a read until EOI.
    pub fn read_eoi_async(&self) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_read_eoi_command())
    }

    /// Read until the device asserts EOI.
    pub fn read_eoi(&self, timeout: Duration) -> Result<Vec<u8>, GpibError> {
        self.execute(self.generate_read_eoi_command(), timeout)?
            .into_bytes()
    }

    /// Build a command that reads `count` bytes.
    pub fn generate_read_n_command(&self, count: usize) -> Command {
        self.command(Operation::ReadN(count))
    }

    /// Submit a read of `count` bytes.
    pub fn read_n_async(&self, count: usize) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_read_n_command(count))
    }

    /// Read exactly `count` bytes.
    pub fn read_n(&self, count: usize, timeout: Duration) -> Result<Vec<u8>, GpibError> {
        self.execute(self.generate_read_n_command(count), timeout)?
            .into_bytes()
    }

    /// Build a command that reads one line.
    pub fn generate_read_line_command(&self, mode: ReadlineTermination) -> Command {
        self.command(Operation::ReadLine(mode))
    }

    /// Submit a read of one line.
    pub fn read_line_async(&self, mode: ReadlineTermination) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_read_line_command(mode))
    }

    /// Read one line, without its terminator.
    pub fn read_line(
        &self,
        mode: ReadlineTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, GpibError> {
        self.execute(self.generate_read_line_command(mode), timeout)?
            .into_bytes()
    }

    // Writes

    /// Build a write command.
    pub fn generate_write_command(&self, data: &[u8]) -> Command {
        self.command(Operation::Write(data.to_vec()))
    }

    /// Submit a write.
    pub fn write_async(&self, data: &[u8]) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_write_command(data))
    }

    /// Write bytes to the device. The bytes are escaped, so any payload is allowed.
    pub fn write(&self, data: &[u8], timeout: Duration) -> Result<(), GpibError> {
        self.execute(self.generate_write_command(data), timeout)?
            .into_done()
    }

    /// Build a write, read until EOI command.
    pub fn generate_write_read_eoi_command(&self, data: &[u8]) -> Command {
        self.command(Operation::WriteReadEoi(data.to_vec()))
    }

    /// Submit a write, read until EOI.
    pub fn write_read_eoi_async(&self, data: &[u8]) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_write_read_eoi_command(data))
    }

    /// Write bytes, then read until EOI.
    pub fn write_read_eoi(&self, data: &[u8], timeout: Duration) -> Result<Vec<u8>, GpibError> {
        self.execute(self.generate_write_read_eoi_command(data), timeout)?
            .into_bytes()
    }

    /// Build a write, read `count` bytes command.
    pub fn generate_write_read_n_command(&self, data: &[u8], count: usize) -> Command {
        self.command(Operation::WriteReadN(data.to_vec(), count))
    }

    /// Submit a write, read `count` bytes.
    pub fn write_read_n_async(
        &self,
        data: &[u8],
        count: usize,
    ) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_write_read_n_command(data, count))
    }

    /// Write bytes, then read exactly `count` bytes.
    pub fn write_read_n(
        &self,
        data: &[u8],
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, GpibError> {
        self.execute(self.generate_write_read_n_command(data, count), timeout)?
            .into_bytes()
    }

    /// Build a write, read one line command.
    pub fn generate_write_read_line_command(
        &self,
        data: &[u8],
        mode: ReadlineTermination,
    ) -> Command {
        self.command(Operation::WriteReadLine(data.to_vec(), mode))
    }

    /// Submit a write, read one line.
    pub fn write_read_line_async(
        &self,
        data: &[u8],
        mode: ReadlineTermination,
    ) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_write_read_line_command(data, mode))
    }

    /// Write bytes, then read one line.
    pub fn write_read_line(
        &self,
        data: &[u8],
        mode: ReadlineTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, GpibError> {
        self.execute(self.generate_write_read_line_command(data, mode), timeout)?
            .into_bytes()
    }

    /// Build a write, read `count` lines command.
    pub fn generate_write_read_line_n_command(
        &self,
        data: &[u8],
        mode: ReadlineTermination,
        count: usize,
    ) -> Command {
        self.command(Operation::WriteReadLineN(data.to_vec(), mode, count))
    }

    /// Submit a write, read `count` lines.
    pub fn write_read_line_n_async(
        &self,
        data: &[u8],
        mode: ReadlineTermination,
        count: usize,
    ) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_write_read_line_n_command(data, mode, count))
    }

    /// Write bytes, then read `count` lines.
    pub fn write_read_line_n(
        &self,
        data: &[u8],
        mode: ReadlineTermination,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>, GpibError> {
        self.execute(
            self.generate_write_read_line_n_command(data, mode, count),
            timeout,
        )?
        .into_lines()
    }

    // Atomic operations

    /// Build an atomic sequence. The sub-commands should target this device, they are not
    /// addressed individually.
    pub fn generate_atomic_sequence_command(&self, commands: Vec<Command>) -> Command {
        self.command(Operation::AtomicSequence(commands))
    }

    /// Submit an atomic sequence.
    pub fn atomic_sequence_async(
        &self,
        commands: Vec<Command>,
    ) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_atomic_sequence_command(commands))
    }

    /// Run the commands in order without any other command in between and return their results.
    ///
    /// The first failing command aborts the sequence and its error is returned. All commands
    /// share the timeout.
    pub fn atomic_sequence(
        &self,
        commands: Vec<Command>,
        timeout: Duration,
    ) -> Result<Vec<Response>, GpibError> {
        self.execute(self.generate_atomic_sequence_command(commands), timeout)?
            .into_sequence()
    }

    /// Build an atomic repeat.
    pub fn generate_atomic_repeat_until_command(
        &self,
        command: Option<Command>,
        until: RepeatPredicate,
    ) -> Command {
        self.command(Operation::AtomicRepeatUntil {
            command: command.map(Box::new),
            until,
        })
    }

    /// Submit an atomic repeat.
    pub fn atomic_repeat_until_async(
        &self,
        command: Option<Command>,
        until: RepeatPredicate,
    ) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_atomic_repeat_until_command(command, until))
    }

    /// Repeat the command until `until` accepts its outcome, and return the accepted outcome.
    ///
    /// Fails with [`GpibError::Timeout`] if the outcome was not accepted before the timeout. A
    /// failed repetition whose error `until` does not accept ends the repeat with that error.
    pub fn atomic_repeat_until(
        &self,
        command: Option<Command>,
        until: RepeatPredicate,
        timeout: Duration,
    ) -> Result<Response, GpibError> {
        self.execute(
            self.generate_atomic_repeat_until_command(command, until),
            timeout,
        )
    }

    // User code

    /// Build a command that runs user code.
    pub fn generate_run_command(&self, runnable: Runnable) -> Command {
        self.command(Operation::UserRunnable(runnable))
    }

    /// Submit user code.
    pub fn run_async(&self, runnable: Runnable) -> Result<PendingCommand, GpibError> {
        self.submit(self.generate_run_command(runnable))
    }

    /// Run user code on the command worker with this device addressed.
    ///
    /// ```no_run
    /// use std::time::Duration;
    ///
    /// use gpibrs::{GpibAddress, PrologixController, ReadlineTermination, Response, Runnable};
    ///
    /// let controller = PrologixController::connect("192.168.10.20").unwrap();
    /// let scope = controller.device(GpibAddress::try_new(7, 0).unwrap());
    /// let curve = scope
    ///     .run(
    ///         Runnable::new(|bus| {
    ///             bus.write(b"CURVE?")?;
    ///             let header = bus.read_n(2)?;
    ///             let digits = (header[1] as char).to_digit(10).unwrap_or(0) as usize;
    ///             let len = String::from_utf8_lossy(&bus.read_n(digits)?).parse().unwrap_or(0);
    ///             let data = bus.read_n(len)?;
    ///             bus.read_line(ReadlineTermination::Lf)?;
    ///             Ok(Response::Bytes(data))
    ///         }),
    ///         Duration::from_secs(10),
    ///     )
    ///     .unwrap();
    /// ```
    pub fn run(&self, runnable: Runnable, timeout: Duration) -> Result<Response, GpibError> {
        self.execute(self.generate_run_command(runnable), timeout)
    }
}
