use std::time::Duration;

use gpibrs::{GatewayConfig, GpibAddress, PrologixController, ReadlineTermination};

fn main() {
    // Log what the controller sends and receives, e.g., with `RUST_LOG=gpibrs=debug`.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Connect to the gateway and preconfigure it.
    let config = GatewayConfig::new("192.168.10.20").with_default_timeout(Duration::from_secs(5));
    let controller = PrologixController::start(config).expect("Gateway must be available.");
    println!(
        "Gateway version: {}",
        controller.controller_version(Duration::from_secs(1)).unwrap()
    );

    // A frequency counter at primary address 3
    let counter = controller.device(GpibAddress::try_new(3, 0).unwrap());
    counter.selected_device_clear(Duration::from_secs(1)).unwrap();
    println!("Counter name: {}", counter.query("*IDN?").unwrap());

    // Read three lines in one go, nothing else can happen on the bus in between.
    let lines = counter
        .write_read_line_n(
            b"MEAS:FREQ?;:MEAS:PER?;:MEAS:PWID?",
            ReadlineTermination::OptCrLf,
            3,
            Duration::from_secs(3),
        )
        .unwrap();
    for line in lines {
        println!("{}", String::from_utf8_lossy(&line));
    }

    // Check whether the counter requests service
    if counter.poll_service_request(Duration::from_secs(1)).unwrap() {
        let stb = counter.serial_poll(Duration::from_secs(1)).unwrap();
        println!("Counter requests service, status byte {stb:#04x}");
    }

    counter.go_to_local(Duration::from_secs(1)).unwrap();
    controller.shutdown();
}
