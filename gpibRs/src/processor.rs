//! The protocol engine: turns one [`Command`] into gateway meta-commands and framed reads and
//! writes.

use std::sync::Arc;

use crate::{
    Command, Deadline, GpibAddress, GpibError, Operation, ReadlineTermination, Response,
    connection::Lifecycle,
    framing::{self, Framing, escape_bytes},
};

/// IEEE-488.1 status byte bit that is set by a device requesting service.
const RQS_BIT: u8 = 0x40;

/// Whether a command is processed on its own or as part of an enclosing atomic operation.
///
/// An outer command drops stale input, addresses its device, and configures the EOT mode before
/// acting. A nested command relies on the enclosing operation having done so already.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scope {
    Outer,
    Nested,
}

/// Processes one command at a time. Only the command worker owns a processor.
#[derive(Debug)]
pub(crate) struct CommandProcessor {
    framing: Framing,
    lifecycle: Arc<Lifecycle>,
    /// EOT setting of the gateway as last sent, `None` if unknown.
    eot_enabled: Option<bool>,
}

impl CommandProcessor {
    pub(crate) fn new(framing: Framing, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            framing,
            lifecycle,
            eot_enabled: Some(false),
        }
    }

    /// Process a top-level command.
    pub(crate) fn process(
        &mut self,
        command: &Command,
        deadline: Deadline,
    ) -> Result<Response, GpibError> {
        if let Some(reason) = self.lifecycle.failure() {
            return Err(GpibError::ConnectionFailed(reason));
        }
        self.dispatch(command, Scope::Outer, deadline)
    }

    fn dispatch(
        &mut self,
        command: &Command,
        scope: Scope,
        deadline: Deadline,
    ) -> Result<Response, GpibError> {
        deadline.check()?;
        tracing::debug!(
            op = command.operation().name(),
            target = ?command.target().map(|a| a.to_string()),
            ?scope,
            "Processing command"
        );

        match command.operation() {
            Operation::NoOp => Ok(Response::Done),
            Operation::ResetController => self.reset_controller(scope, deadline),
            Operation::ControllerVersion => {
                if scope == Scope::Outer {
                    self.framing.clear();
                }
                self.meta("++ver", deadline)?;
                let line = self.framing.read_line(ReadlineTermination::OptCrLf, deadline)?;
                Ok(Response::Text(String::from_utf8_lossy(&line).trim().to_string()))
            }
            Operation::SelectedDeviceClear => self.simple(command, scope, "++clr", deadline),
            Operation::Trigger => self.simple(command, scope, "++trg", deadline),
            Operation::GoToLocal => self.simple(command, scope, "++loc", deadline),
            Operation::SerialPoll => {
                self.enter(command, scope, deadline)?;
                self.ensure_eot(false, deadline)?;
                self.serial_poll(deadline).map(Response::StatusByte)
            }
            Operation::PollServiceRequest => {
                self.enter(command, scope, deadline)?;
                self.ensure_eot(false, deadline)?;
                self.poll_service_request(deadline)
                    .map(Response::ServiceRequest)
            }
            Operation::ReadEoi => {
                self.enter(command, scope, deadline)?;
                self.read_eoi(deadline).map(Response::Bytes)
            }
            Operation::ReadN(count) => {
                self.enter(command, scope, deadline)?;
                self.read_n(*count, deadline).map(Response::Bytes)
            }
            Operation::ReadLine(mode) => {
                self.enter(command, scope, deadline)?;
                self.read_line(*mode, deadline).map(Response::Bytes)
            }
            Operation::Write(data) => {
                self.enter(command, scope, deadline)?;
                self.ensure_eot(false, deadline)?;
                self.write(data, deadline)?;
                Ok(Response::Done)
            }
            Operation::WriteReadEoi(data) => {
                self.enter(command, scope, deadline)?;
                self.ensure_eot(true, deadline)?;
                self.write(data, deadline)?;
                self.read_eoi(deadline).map(Response::Bytes)
            }
            Operation::WriteReadN(data, count) => {
                self.enter(command, scope, deadline)?;
                self.ensure_eot(false, deadline)?;
                self.write(data, deadline)?;
                self.read_n(*count, deadline).map(Response::Bytes)
            }
            Operation::WriteReadLine(data, mode) => {
                self.enter(command, scope, deadline)?;
                self.ensure_eot(false, deadline)?;
                self.write(data, deadline)?;
                self.read_line(*mode, deadline).map(Response::Bytes)
            }
            Operation::WriteReadLineN(data, mode, count) => {
                self.enter(command, scope, deadline)?;
                self.ensure_eot(false, deadline)?;
                self.write(data, deadline)?;
                let mut lines = Vec::with_capacity(*count);
                for _ in 0..*count {
                    lines.push(self.read_line(*mode, deadline)?);
                }
                Ok(Response::Lines(lines))
            }
            Operation::AtomicSequence(commands) => {
                if commands.is_empty() {
                    return Ok(Response::Sequence(Vec::new()));
                }
                self.enter(command, scope, deadline)?;
                let mut results = Vec::with_capacity(commands.len());
                for sub in commands {
                    results.push(self.dispatch(sub, Scope::Nested, deadline)?);
                }
                Ok(Response::Sequence(results))
            }
            Operation::AtomicRepeatUntil { command: sub, until } => {
                let Some(sub) = sub else {
                    return Ok(Response::Done);
                };
                self.enter(command, scope, deadline)?;
                loop {
                    deadline.check()?;
                    let outcome = self.dispatch(sub, Scope::Nested, deadline);
                    if until.test(&outcome) {
                        return outcome;
                    }
                    // A failure the predicate does not accept ends the repetition.
                    outcome?;
                }
            }
            Operation::UserRunnable(runnable) => {
                self.enter(command, scope, deadline)?;
                let mut bus = BusContext {
                    processor: self,
                    deadline,
                    target: command.target(),
                };
                runnable.run(&mut bus)
            }
        }
    }

    /// Outer scope only: drop stale input, address the target, and forget the EOT setting such
    /// that the next leaf operation configures it explicitly.
    fn enter(&mut self, command: &Command, scope: Scope, deadline: Deadline) -> Result<(), GpibError> {
        if scope == Scope::Nested {
            return Ok(());
        }
        self.framing.clear();
        let target = command.target().ok_or_else(|| {
            GpibError::InvalidArgument(format!(
                "Operation {} requires a device address.",
                command.operation().name()
            ))
        })?;
        self.address(target, deadline)?;
        self.eot_enabled = None;
        Ok(())
    }

    fn address(&mut self, target: GpibAddress, deadline: Deadline) -> Result<(), GpibError> {
        self.meta(&format!("++addr {}", target.addr_args()), deadline)
    }

    fn ensure_eot(&mut self, enable: bool, deadline: Deadline) -> Result<(), GpibError> {
        if self.eot_enabled == Some(enable) {
            return Ok(());
        }
        self.eot_enabled = None;
        if enable {
            self.meta("++eot_enable 1", deadline)?;
            self.meta(&format!("++eot_char {}", self.framing.eot_char()), deadline)?;
        } else {
            self.meta("++eot_enable 0", deadline)?;
        }
        self.eot_enabled = Some(enable);
        Ok(())
    }

    fn meta(&self, cmd: &str, deadline: Deadline) -> Result<(), GpibError> {
        deadline.check()?;
        self.framing.write_meta(cmd)
    }

    fn write(&self, data: &[u8], deadline: Deadline) -> Result<(), GpibError> {
        deadline.check()?;
        self.framing.cook_and_write(data)
    }

    fn simple(
        &mut self,
        command: &Command,
        scope: Scope,
        cmd: &str,
        deadline: Deadline,
    ) -> Result<Response, GpibError> {
        self.enter(command, scope, deadline)?;
        self.ensure_eot(false, deadline)?;
        self.meta(cmd, deadline)?;
        Ok(Response::Done)
    }

    fn read_eoi(&mut self, deadline: Deadline) -> Result<Vec<u8>, GpibError> {
        self.ensure_eot(true, deadline)?;
        self.meta("++read eoi", deadline)?;
        self.framing.read_eoi(deadline)
    }

    fn read_n(&mut self, count: usize, deadline: Deadline) -> Result<Vec<u8>, GpibError> {
        self.ensure_eot(false, deadline)?;
        self.meta("++read eoi", deadline)?;
        self.framing.read_n(count, deadline)
    }

    fn read_line(
        &mut self,
        mode: ReadlineTermination,
        deadline: Deadline,
    ) -> Result<Vec<u8>, GpibError> {
        self.ensure_eot(false, deadline)?;
        self.meta(&format!("++read {}", mode.read_arg()), deadline)?;
        self.framing.read_line(mode, deadline)
    }

    fn serial_poll(&mut self, deadline: Deadline) -> Result<u8, GpibError> {
        self.meta("++spoll", deadline)?;
        let line = self.framing.read_line(ReadlineTermination::OptCrLf, deadline)?;
        parse_number(&line)
    }

    /// Ask the gateway whether any device asserts SRQ, and only if so, serial poll the addressed
    /// device to find out whether it is the one.
    fn poll_service_request(&mut self, deadline: Deadline) -> Result<bool, GpibError> {
        self.meta("++srq", deadline)?;
        let line = self.framing.read_line(ReadlineTermination::OptCrLf, deadline)?;
        if parse_number(&line)? == 0 {
            return Ok(false);
        }
        let status = self.serial_poll(deadline)?;
        Ok(status & RQS_BIT != 0)
    }

    fn reset_controller(&mut self, scope: Scope, deadline: Deadline) -> Result<Response, GpibError> {
        if scope == Scope::Nested {
            return Err(GpibError::UnsupportedOperation(
                "reset-controller cannot run inside an atomic operation".to_string(),
            ));
        }
        self.framing.clear();
        self.eot_enabled = None;
        for cmd in framing::PRECONFIGURE {
            self.meta(cmd, deadline)?;
        }
        self.eot_enabled = Some(false);
        Ok(Response::Done)
    }
}

fn parse_number(line: &[u8]) -> Result<u8, GpibError> {
    let text = String::from_utf8_lossy(line);
    text.trim()
        .parse()
        .map_err(|_| GpibError::ResponseParseError(escape_bytes(line)))
}

/// Access to the bus from inside a [`crate::UserRunnable`].
///
/// The device is already addressed when the runnable starts. All operations share the deadline of
/// the command that runs the runnable.
pub struct BusContext<'a> {
    processor: &'a mut CommandProcessor,
    deadline: Deadline,
    target: Option<GpibAddress>,
}

impl BusContext<'_> {
    /// The deadline of the enclosing command.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// The address of the device the runnable was submitted for.
    pub fn target(&self) -> Option<GpibAddress> {
        self.target
    }

    /// Write bytes to the device.
    pub fn write(&mut self, data: &[u8]) -> Result<(), GpibError> {
        self.processor.ensure_eot(false, self.deadline)?;
        self.processor.write(data, self.deadline)
    }

    /// Read from the device until EOI.
    pub fn read_eoi(&mut self) -> Result<Vec<u8>, GpibError> {
        self.processor.read_eoi(self.deadline)
    }

    /// Read exactly `count` bytes from the device.
    pub fn read_n(&mut self, count: usize) -> Result<Vec<u8>, GpibError> {
        self.processor.read_n(count, self.deadline)
    }

    /// Read one line from the device.
    pub fn read_line(&mut self, mode: ReadlineTermination) -> Result<Vec<u8>, GpibError> {
        self.processor.read_line(mode, self.deadline)
    }

    /// Run another command in the current context, without re-addressing.
    pub fn execute(&mut self, command: &Command) -> Result<Response, GpibError> {
        self.processor.dispatch(command, Scope::Nested, self.deadline)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        net::{TcpListener, TcpStream},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{channel::ByteChannel, connection::SocketHandle};

    /// A processor wired to a local socket; returns the processor, the device side of the socket,
    /// and the byte channel.
    fn wired() -> (CommandProcessor, TcpStream, Arc<ByteChannel>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let host = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (device, _) = listener.accept().unwrap();
        device
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let socket = SocketHandle::default();
        socket.replace(Some(Arc::new(host)));
        let channel = Arc::new(ByteChannel::new(1024));
        let framing = Framing::new(
            Arc::clone(&channel),
            socket,
            0xFF,
            Duration::from_millis(20),
        );
        let processor = CommandProcessor::new(framing, Arc::new(crate::connection::Lifecycle::new()));
        (processor, device, channel)
    }

    /// Read everything the host sent so far.
    fn drain(device: &mut TcpStream) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while let Ok(n) = device.read(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    fn addr5() -> GpibAddress {
        GpibAddress::try_new(5, 0).unwrap()
    }

    fn sleeper(ms: u64) -> Command {
        Command::new(
            addr5(),
            Operation::UserRunnable(crate::command::Runnable::new(move |_bus| {
                thread::sleep(Duration::from_millis(ms));
                Ok(Response::Done)
            })),
        )
    }

    #[test]
    fn test_sequence_reports_timeout_of_later_step() {
        let (mut processor, mut device, _channel) = wired();
        let seq = Command::new(
            addr5(),
            Operation::AtomicSequence(vec![
                Command::new(addr5(), Operation::NoOp),
                sleeper(150),
                Command::new(addr5(), Operation::Write(b"X".to_vec())),
            ]),
        );

        let res = processor.process(&seq, Deadline::after(Duration::from_millis(100)));
        assert!(matches!(res, Err(GpibError::Timeout(_))));
        assert_eq!(drain(&mut device), "++addr 5\n");
    }

    #[test]
    fn test_nested_commands_are_not_readdressed() {
        let (mut processor, mut device, channel) = wired();
        channel.push(b"ok\n");
        let seq = Command::new(
            addr5(),
            Operation::AtomicSequence(vec![
                Command::new(addr5(), Operation::Write(b"A".to_vec())),
                Command::new(addr5(), Operation::ReadLine(ReadlineTermination::Lf)),
            ]),
        );

        // Bytes pushed before the outer step are stale and dropped, so feed the reply later.
        let feeder = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                channel.push(b"ok\n");
            })
        };
        let res = processor
            .process(&seq, Deadline::after(Duration::from_secs(2)))
            .unwrap();
        feeder.join().unwrap();

        assert_eq!(
            res,
            Response::Sequence(vec![Response::Done, Response::Bytes(b"ok".to_vec())])
        );
        assert_eq!(
            drain(&mut device),
            "++addr 5\n++eot_enable 0\nA\n++read 10\n"
        );
    }

    #[test]
    fn test_eot_is_only_resent_when_needed() {
        let (mut processor, mut device, channel) = wired();
        let seq = Command::new(
            addr5(),
            Operation::AtomicSequence(vec![
                Command::new(addr5(), Operation::ReadEoi),
                Command::new(addr5(), Operation::ReadEoi),
                Command::new(addr5(), Operation::Write(b"B".to_vec())),
            ]),
        );
        let feeder = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                channel.push(&[b'1', 0xFF]);
                thread::sleep(Duration::from_millis(100));
                channel.push(&[b'2', 0xFF]);
            })
        };
        let res = processor
            .process(&seq, Deadline::after(Duration::from_secs(2)))
            .unwrap();
        feeder.join().unwrap();

        assert_eq!(
            res.into_sequence().unwrap(),
            vec![
                Response::Bytes(b"1".to_vec()),
                Response::Bytes(b"2".to_vec()),
                Response::Done
            ]
        );
        assert_eq!(
            drain(&mut device),
            "++addr 5\n++eot_enable 1\n++eot_char 255\n++read eoi\n++read eoi\n++eot_enable 0\nB\n"
        );
    }

    #[test]
    fn test_reset_controller_nested_is_unsupported() {
        let (mut processor, _device, _channel) = wired();
        let seq = Command::new(
            addr5(),
            Operation::AtomicSequence(vec![Command::controller(Operation::ResetController)]),
        );
        let res = processor.process(&seq, Deadline::after(Duration::from_secs(1)));
        assert!(matches!(res, Err(GpibError::UnsupportedOperation(_))));
    }

    #[test]
    fn test_empty_atomic_operations_succeed_without_io() {
        let (mut processor, mut device, _channel) = wired();
        let seq = Command::new(addr5(), Operation::AtomicSequence(vec![]));
        assert_eq!(
            processor
                .process(&seq, Deadline::after(Duration::from_secs(1)))
                .unwrap(),
            Response::Sequence(vec![])
        );

        let repeat = Command::new(
            addr5(),
            Operation::AtomicRepeatUntil {
                command: None,
                until: crate::RepeatPredicate::new(|_| true),
            },
        );
        assert_eq!(
            processor
                .process(&repeat, Deadline::after(Duration::from_secs(1)))
                .unwrap(),
            Response::Done
        );
        assert_eq!(drain(&mut device), "");
    }

    #[test]
    fn test_repeat_until_stops_at_first_rejected_failure() {
        let (mut processor, _device, _channel) = wired();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let failing = {
            let calls = Arc::clone(&calls);
            Command::new(
                addr5(),
                Operation::UserRunnable(crate::command::Runnable::new(move |_bus| {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(GpibError::Framing("bad terminator".to_string()))
                })),
            )
        };
        let repeat = Command::new(
            addr5(),
            Operation::AtomicRepeatUntil {
                command: Some(Box::new(failing)),
                until: crate::RepeatPredicate::new(|outcome| outcome.is_ok()),
            },
        );

        let res = processor.process(&repeat, Deadline::after(Duration::from_millis(500)));
        assert!(matches!(res, Err(GpibError::Framing(_))));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expired_deadline_fails_before_io() {
        let (mut processor, mut device, _channel) = wired();
        let cmd = Command::new(addr5(), Operation::Write(b"X".to_vec()));
        let res = processor.process(&cmd, Deadline::after(Duration::ZERO));
        assert!(matches!(res, Err(GpibError::Timeout(_))));
        assert_eq!(drain(&mut device), "");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(b" 64 ").unwrap(), 64);
        assert!(matches!(
            parse_number(b"abc"),
            Err(GpibError::ResponseParseError(_))
        ));
    }
}
