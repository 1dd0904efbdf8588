//! Tests of the device operations against a scripted gateway.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use rstest::*;

use gpibrs::{
    Command, Exchange, GpibAddress, GpibDevice, GpibError, LoopbackGateway, Operation,
    PrologixController, ReadlineTermination, RepeatPredicate, Response, Runnable,
};

const TIMEOUT: Duration = Duration::from_secs(2);

/// The default device address used in these tests.
#[fixture]
fn addr() -> GpibAddress {
    GpibAddress::try_new(5, 0).unwrap()
}

/// Start a scripted gateway and a controller connected to it.
fn connect(script: Vec<Exchange>) -> (LoopbackGateway, PrologixController) {
    let gateway = LoopbackGateway::with_preconfigure(script);
    let controller = PrologixController::start(gateway.config()).unwrap();
    (gateway, controller)
}

/// Shut down the controller first, such that the gateway sees the connection close.
fn finish(mut gateway: LoopbackGateway, controller: PrologixController) {
    controller.shutdown();
    gateway.finalize();
}

/// Script lines every outer command to device 5 starts with.
fn addressed(mut script: Vec<Exchange>) -> Vec<Exchange> {
    let mut full = vec![Exchange::host("++addr 5"), Exchange::host("++eot_enable 0")];
    full.append(&mut script);
    full
}

#[rstest]
fn write_escapes_payload(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![Exchange::host_bytes(
        b"A\x1b+B\x1b\n\n",
    )]));
    let dev = controller.device(addr);

    dev.write(b"A+B\n", TIMEOUT).unwrap();
    finish(gateway, controller);
}

#[rstest]
fn sendcmd_and_query(addr: GpibAddress) {
    let (gateway, controller) = connect(vec![
        Exchange::host("++addr 5"),
        Exchange::host("++eot_enable 0"),
        Exchange::host("*RST"),
        Exchange::host("++addr 5"),
        Exchange::host("++eot_enable 0"),
        Exchange::host("*IDN?"),
        Exchange::host("++read 10"),
        Exchange::inst(b"ACME,Counter,42\r\n"),
    ]);
    let dev = controller.device(addr);

    dev.sendcmd("*RST").unwrap();
    assert_eq!(dev.query("*IDN?").unwrap(), "ACME,Counter,42");
    finish(gateway, controller);
}

#[rstest]
fn secondary_address_is_sent() {
    let (gateway, controller) = connect(vec![
        Exchange::host("++addr 5 96"),
        Exchange::host("++eot_enable 0"),
        Exchange::host("++clr"),
    ]);
    let dev = controller.device("gpib:5,96".parse().unwrap());

    dev.selected_device_clear(TIMEOUT).unwrap();
    finish(gateway, controller);
}

#[rstest]
#[case("++clr")]
#[case("++trg")]
#[case("++loc")]
fn simple_bus_commands(addr: GpibAddress, #[case] meta: &str) {
    let (gateway, controller) = connect(addressed(vec![Exchange::host(meta)]));
    let dev = controller.device(addr);

    match meta {
        "++clr" => dev.selected_device_clear(TIMEOUT).unwrap(),
        "++trg" => dev.trigger(TIMEOUT).unwrap(),
        _ => dev.go_to_local(TIMEOUT).unwrap(),
    }
    finish(gateway, controller);
}

#[rstest]
fn read_eoi_strips_sentinel(addr: GpibAddress) {
    let (gateway, controller) = connect(vec![
        Exchange::host("++addr 5"),
        Exchange::host("++eot_enable 1"),
        Exchange::host("++eot_char 255"),
        Exchange::host("++read eoi"),
        Exchange::inst(b"1.5,2.5\xff"),
    ]);
    let dev = controller.device(addr);

    assert_eq!(dev.read_eoi(TIMEOUT).unwrap(), b"1.5,2.5");
    finish(gateway, controller);
}

#[rstest]
fn read_eoi_keeps_sentinel_in_data(addr: GpibAddress) {
    let (gateway, controller) = connect(vec![
        Exchange::host("++addr 5"),
        Exchange::host("++eot_enable 1"),
        Exchange::host("++eot_char 255"),
        Exchange::host("++read eoi"),
        Exchange::inst(&[0x41, 0xFF, 0x42, 0xFF]),
    ]);
    let dev = controller.device(addr);

    let pending = dev.read_eoi_async().unwrap();
    assert_eq!(pending.wait().unwrap(), Response::Bytes(vec![0x41, 0xFF, 0x42]));
    finish(gateway, controller);
}

#[rstest]
fn write_read_n_binary(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("CURV?"),
        Exchange::host("++read eoi"),
        Exchange::inst(&[0x00, 0x0A, 0xFF, 0x0D]),
    ]));
    let dev = controller.device(addr);

    assert_eq!(
        dev.write_read_n(b"CURV?", 4, TIMEOUT).unwrap(),
        vec![0x00, 0x0A, 0xFF, 0x0D]
    );
    finish(gateway, controller);
}

#[rstest]
fn write_read_line_n(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("MEAS?"),
        Exchange::host("++read 13"),
        Exchange::inst(b"1\n\r"),
        Exchange::host("++read 13"),
        Exchange::inst(b"2\n\r"),
    ]));
    let dev = controller.device(addr);

    let lines = dev
        .write_read_line_n(b"MEAS?", ReadlineTermination::LfCr, 2, TIMEOUT)
        .unwrap();
    assert_eq!(lines, vec![b"1".to_vec(), b"2".to_vec()]);
    finish(gateway, controller);
}

#[rstest]
fn malformed_line_is_framing_error(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("++read 10"),
        Exchange::inst(b"abc\rX"),
    ]));
    let dev = controller.device(addr);

    assert!(matches!(
        dev.read_line(ReadlineTermination::OptCrLf, TIMEOUT),
        Err(GpibError::Framing(_))
    ));
    finish(gateway, controller);
}

#[rstest]
fn serial_poll(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("++spoll"),
        Exchange::inst(b"80\r\n"),
    ]));
    let dev = controller.device(addr);

    assert_eq!(dev.serial_poll(TIMEOUT).unwrap(), 80);
    finish(gateway, controller);
}

#[rstest]
fn serial_poll_non_numeric_reply(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("++spoll"),
        Exchange::inst(b"busy\n"),
    ]));
    let dev = controller.device(addr);

    assert!(matches!(
        dev.serial_poll(TIMEOUT),
        Err(GpibError::ResponseParseError(_))
    ));
    finish(gateway, controller);
}

#[rstest]
fn poll_service_request_without_srq_skips_serial_poll(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("++srq"),
        Exchange::inst(b"0\n"),
    ]));
    let dev = controller.device(addr);

    assert!(!dev.poll_service_request(TIMEOUT).unwrap());
    finish(gateway, controller);
}

#[rstest]
#[case(b"64\n", true)]
#[case(b"80\n", true)]
#[case(b"16\n", false)]
fn poll_service_request_checks_rqs_bit(
    addr: GpibAddress,
    #[case] status: &[u8],
    #[case] expected: bool,
) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("++srq"),
        Exchange::inst(b"1\n"),
        Exchange::host("++spoll"),
        Exchange::inst(status),
    ]));
    let dev = controller.device(addr);

    assert_eq!(dev.poll_service_request(TIMEOUT).unwrap(), expected);
    finish(gateway, controller);
}

#[rstest]
fn atomic_sequence_addresses_once(addr: GpibAddress) {
    let (gateway, controller) = connect(vec![
        Exchange::host("++addr 5"),
        Exchange::host("++eot_enable 0"),
        Exchange::host("CONF:FREQ"),
        Exchange::host("READ?"),
        Exchange::host("++read 10"),
        Exchange::inst(b"1.0E6\n"),
    ]);
    let dev = controller.device(addr);

    let results = dev
        .atomic_sequence(
            vec![
                dev.generate_write_command(b"CONF:FREQ"),
                dev.generate_write_read_line_command(b"READ?", ReadlineTermination::Lf),
            ],
            TIMEOUT,
        )
        .unwrap();
    assert_eq!(
        results,
        vec![Response::Done, Response::Bytes(b"1.0E6".to_vec())]
    );
    finish(gateway, controller);
}

#[rstest]
fn atomic_sequence_reports_failing_step(addr: GpibAddress) {
    let (gateway, controller) = connect(vec![
        Exchange::host("++addr 5"),
        Exchange::host("++eot_enable 0"),
        Exchange::host("++read 10"),
    ]);
    let dev = controller.device(addr);

    let res = dev.atomic_sequence(
        vec![
            dev.generate_read_line_command(ReadlineTermination::Lf),
            dev.generate_trigger_command(),
        ],
        Duration::from_millis(300),
    );
    assert!(matches!(res, Err(GpibError::Timeout(_))));
    finish(gateway, controller);
}

#[rstest]
fn atomic_repeat_until_status_bit(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("++spoll"),
        Exchange::inst(b"0\n"),
        Exchange::host("++spoll"),
        Exchange::inst(b"1\n"),
        Exchange::host("++spoll"),
        Exchange::inst(b"17\n"),
    ]));
    let dev = controller.device(addr);

    let done = RepeatPredicate::new(|outcome| {
        matches!(outcome, Ok(Response::StatusByte(stb)) if stb & 0x10 != 0)
    });
    let res = dev
        .atomic_repeat_until(Some(dev.generate_serial_poll_command()), done, TIMEOUT)
        .unwrap();
    assert_eq!(res, Response::StatusByte(17));
    finish(gateway, controller);
}

#[rstest]
fn atomic_repeat_until_reports_failed_repetition(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("++spoll"),
        Exchange::inst(b"0\n"),
        Exchange::host("++spoll"),
        Exchange::inst(b"busy\n"),
    ]));
    let dev = controller.device(addr);

    let done = RepeatPredicate::new(|outcome| {
        matches!(outcome, Ok(Response::StatusByte(stb)) if stb & 0x10 != 0)
    });
    assert!(matches!(
        dev.atomic_repeat_until(Some(dev.generate_serial_poll_command()), done, TIMEOUT),
        Err(GpibError::ResponseParseError(_))
    ));
    finish(gateway, controller);
}

#[rstest]
fn atomic_repeat_until_accepts_failure(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("++spoll"),
        Exchange::inst(b"0\n"),
        Exchange::host("++spoll"),
        Exchange::inst(b"4\n"),
        Exchange::host("++spoll"),
        Exchange::inst(b"offline\n"),
    ]));
    let dev = controller.device(addr);

    let gone = RepeatPredicate::new(|outcome| outcome.is_err());
    assert!(matches!(
        dev.atomic_repeat_until(Some(dev.generate_serial_poll_command()), gone, TIMEOUT),
        Err(GpibError::ResponseParseError(_))
    ));
    finish(gateway, controller);
}

#[rstest]
fn atomic_repeat_until_without_command(addr: GpibAddress) {
    let (gateway, controller) = connect(vec![]);
    let dev = controller.device(addr);

    let res = dev
        .atomic_repeat_until(None, RepeatPredicate::new(|_| false), TIMEOUT)
        .unwrap();
    assert_eq!(res, Response::Done);
    finish(gateway, controller);
}

#[rstest]
fn runnable_in_addressed_context(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![
        Exchange::host("DATA?"),
        Exchange::host("++read eoi"),
        Exchange::inst(b"#14"),
        Exchange::host("++read eoi"),
        Exchange::inst(b"abcd"),
    ]));
    let dev = controller.device(addr);

    let res = dev
        .run(
            Runnable::new(|bus| {
                bus.write(b"DATA?")?;
                let header = bus.read_n(3)?;
                let len = (header[2] - b'0') as usize;
                bus.read_n(len).map(Response::Bytes)
            }),
            TIMEOUT,
        )
        .unwrap();
    assert_eq!(res, Response::Bytes(b"abcd".to_vec()));
    finish(gateway, controller);
}

#[rstest]
fn runnable_can_execute_nested_commands(addr: GpibAddress) {
    let (gateway, controller) = connect(addressed(vec![Exchange::host("++trg")]));
    let dev = controller.device(addr);
    let trigger = dev.generate_trigger_command();

    let res = dev
        .run(Runnable::new(move |bus| bus.execute(&trigger)), TIMEOUT)
        .unwrap();
    assert_eq!(res, Response::Done);
    finish(gateway, controller);
}

#[rstest]
fn timeout_does_not_leak_into_next_command(addr: GpibAddress) {
    let (gateway, controller) = connect(vec![
        Exchange::host("++addr 5"),
        Exchange::host("++addr 5"),
        Exchange::host("++eot_enable 0"),
        Exchange::host("++spoll"),
        Exchange::inst(b"4\n"),
    ]);
    let dev = controller.device(addr);

    let completions = Arc::new(AtomicUsize::new(0));
    let listener = {
        let completions = Arc::clone(&completions);
        controller.queue().add_listener(move |_cmd, _res| {
            completions.fetch_add(1, Ordering::SeqCst);
        })
    };

    let slow = Runnable::new(|_bus| {
        thread::sleep(Duration::from_millis(300));
        Ok(Response::Text("late".to_string()))
    });
    assert!(matches!(
        dev.run(slow, Duration::from_millis(100)),
        Err(GpibError::Timeout(_))
    ));

    assert_eq!(dev.serial_poll(TIMEOUT).unwrap(), 4);
    assert_eq!(completions.load(Ordering::SeqCst), 2);
    assert!(controller.queue().remove_listener(listener));
    finish(gateway, controller);
}

#[rstest]
fn commands_from_many_threads_do_not_interleave() {
    let mut script = Vec::new();
    for _ in 0..4 {
        script.extend(addressed(vec![
            Exchange::host("X?"),
            Exchange::host("++read 10"),
            Exchange::inst(b"ok\n"),
        ]));
    }
    let (gateway, controller) = connect(script);
    let dev: GpibDevice = controller.device(GpibAddress::try_new(5, 0).unwrap());

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let dev = dev.clone();
            thread::spawn(move || dev.query("X?").unwrap())
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), "ok");
    }
    finish(gateway, controller);
}

#[rstest]
fn generated_commands_target_the_device(addr: GpibAddress) {
    let (gateway, controller) = connect(vec![]);
    let dev = controller.device(addr);

    let cmd: Command = dev.generate_read_n_command(8);
    assert_eq!(cmd.target(), Some(addr));
    assert!(matches!(cmd.operation(), Operation::ReadN(8)));
    finish(gateway, controller);
}
