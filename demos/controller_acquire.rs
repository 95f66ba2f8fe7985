use anyhow::Result;
use kapascan::{Controller, ControllerSettings, TriggerMode};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let host = args.get(1).map(String::as_str).unwrap_or("192.168.254.173");
    let sensor = args.get(2).map(String::as_str).unwrap_or("1739");
    let points: usize = match args.get(3) {
        Some(n) => n.parse()?,
        None => 100,
    };

    let settings = ControllerSettings::new(host, &[sensor]);
    let mut controller = Controller::connect(&settings)?;

    println!("Version     : {}", controller.version()?);
    println!("Data port   : {}", controller.data_port()?);
    println!("Status      : {}", controller.status()?);

    let actual = controller.set_sampling_time(0.256)?;
    println!("Sampling    : {actual} ms");
    controller.set_trigger_mode(TriggerMode::Continuous)?;

    let data = controller.acquire(points)?;
    for (sensor, samples) in controller.sensors().iter().zip(&data) {
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let (min, max) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        println!(
            "{} on ch{}: mean {:.4} µm, min {:.4}, max {:.4}",
            sensor.serial_nr, sensor.channel, mean, min, max
        );
    }

    controller.close();
    Ok(())
}
