use anyhow::Result;
use kapascan::{MachineState, MoveMode, SerialSettings, Stage};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port = args.get(1).map(String::as_str).unwrap_or("/dev/ttyACM0");
    let x: f64 = match args.get(2) {
        Some(v) => v.parse()?,
        None => 10.0,
    };
    let y: f64 = match args.get(3) {
        Some(v) => v.parse()?,
        None => 10.0,
    };

    let mut stage = Stage::connect(&SerialSettings::new(port))?;
    let limits = *stage.limits();
    println!("Steps/mm    : {:?}", limits.steps_per_mm);
    println!("Max rate    : {:?} mm/min", limits.max_rate);
    println!("Max travel  : {:?} mm", limits.max_travel);

    let status = stage.status()?;
    println!("State       : {:?}", status.state);
    if status.state == MachineState::Alarm {
        println!("Homing...");
        stage.home()?;
    }

    stage.move_to(x, y, MoveMode::Absolute)?;
    stage.synchronize(std::time::Duration::from_secs(60))?;
    let position = stage.position()?;
    println!("Position    : X{:.4} Y{:.4}", position.x, position.y);

    // Small jog back and forth along X.
    stage.jog(0.5, 0.0, 100.0)?;
    stage.jog(-0.5, 0.0, 100.0)?;
    stage.synchronize(std::time::Duration::from_secs(60))?;

    stage.close();
    Ok(())
}
