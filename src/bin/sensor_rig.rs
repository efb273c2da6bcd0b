use clap::{App, Arg};
use colored::Colorize;
use pihwctrl::config::RangeFinderConfig;
use pihwctrl::controls::StateChangeFilter;
use pihwctrl::gpio::{GpioChannel, GpioInputConfig, GpioPwmConfig};
use pihwctrl::mock::{MockBinaryInput, MockBus, MockSwitch};
use pihwctrl::modules::lsm303dlhc::LSM303DLHC_MAG_ADDR;
use pihwctrl::modules::{Input, MagChannel, Measurement, RangeChannel, SPEED_OF_SOUND};
use pihwctrl::sim::{Ads1115Sim, Bmp180Sim, Lsm303dlhcSim, Pca9685Sim};
use pihwctrl::{
    Ads1115, Bmp180, Clock, EngineStats, GpioBinaryInput, GpioPwm, Hcsr04, Hcsr04Config,
    Lsm303dlhc, Observable, Pca9685, Pwm, RigConfig, SharedBus, SharedClock, SystemClock, Vector,
};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time;
use tracing::{info, warn, Level};

/// Distance to the simulated obstacle in front of the range finder.
const OBSTACLE_M: f64 = 0.5;

/// Horizontal strength of the simulated geomagnetic field, in gauss.
const EARTH_FIELD_GAUSS: f64 = 0.45;

#[derive(Debug, Serialize)]
struct Reading {
    source: &'static str,
    channel: String,
    value: f64,
    at_ms: u64,
}

fn default_rig() -> RigConfig {
    RigConfig {
        ads1115: Some(Default::default()),
        bmp180: Some(Default::default()),
        hcsr04: Some(RangeFinderConfig {
            trigger_pin: 23,
            echo_pin: 24,
            sensor: Hcsr04Config::default(),
        }),
        lsm303dlhc: Some(Default::default()),
        pca9685: Some(Default::default()),
        inputs: vec![GpioInputConfig::new(17)],
        pwm_outputs: vec![GpioPwmConfig::new(18)],
    }
}

fn reporter(
    tx: &UnboundedSender<Reading>,
    clock: &SharedClock,
    source: &'static str,
    channel: String,
) -> impl FnMut(&f64) + Send + 'static {
    let tx = tx.clone();
    let clock = SharedClock::clone(clock);
    move |value: &f64| {
        let _ = tx.send(Reading {
            source,
            channel: channel.clone(),
            value: *value,
            at_ms: clock.now().as_millis() as u64,
        });
    }
}

fn print_reading(reading: &Reading, json: bool) {
    if json {
        match serde_json::to_string(reading) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("Failed to serialize reading: {}", e),
        }
        return;
    }
    let value = format!("{:>10.4}", reading.value);
    let value = match reading.source {
        "ads1115" => value.cyan(),
        "bmp180" => value.green(),
        "hcsr04" => value.yellow(),
        "lsm303" => value.blue(),
        _ => value.magenta(),
    };
    println!(
        "{:>8} ms  {:<8} {:<16} {}",
        reading.at_ms,
        reading.source.bold(),
        reading.channel,
        value
    );
}

fn print_stats(name: &str, stats: EngineStats) {
    println!(
        "{:<8} cycles {:>6}  samples {:>6}  failures {:>4}",
        name.bold(),
        stats.cycles,
        stats.samples,
        stats.failures
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("sensor-rig")
        .version(env!("CARGO_PKG_VERSION"))
        .about(
            "Runs the sensor drivers against simulated devices and streams their readings. \
             The HC-SR04 echo is always simulated: its configured pins are reserved, not driven.",
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON rig configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("period")
                .short("p")
                .long("period")
                .value_name("MS")
                .help("Sampling period override in milliseconds")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this many seconds instead of waiting for Ctrl-C")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Print one JSON object per reading"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Increase log verbosity"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match matches.value_of("config") {
        Some(path) => RigConfig::load(path)?,
        None => default_rig(),
    };
    let period = matches
        .value_of("period")
        .map(str::parse::<u64>)
        .transpose()?
        .map(Duration::from_millis);
    let duration = matches
        .value_of("duration")
        .map(str::parse::<u64>)
        .transpose()?
        .map(Duration::from_secs);
    let json = matches.is_present("json");

    if !json {
        println!("{}", "Sensor rig (simulated devices)".bold());
        println!("==============================");
    }

    let mock = MockBus::strict();
    let bus = SharedBus::new(mock.clone());
    let clock = SystemClock::shared();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let ads_sim = Ads1115Sim::new();
    let ads = match &config.ads1115 {
        Some(ads_config) => {
            mock.attach(ads_config.address.addr(), ads_sim.clone());
            ads_sim.set_voltage(Input::Ain0Gnd, 3.3);
            ads_sim.set_voltage(Input::Ain1Gnd, 0.2);
            let ads = Ads1115::new(bus.clone(), SharedClock::clone(&clock), ads_config)?;
            for input in [Input::Ain0Gnd, Input::Ain1Gnd] {
                let mut report = reporter(&tx, &clock, "ads1115", format!("{input:?}"));
                ads.add_observer(input, move |volts: &f32| report(&f64::from(*volts)));
            }
            Some(ads)
        }
        None => None,
    };

    let bmp = match &config.bmp180 {
        Some(bmp_config) => {
            mock.attach(0x77, Bmp180Sim::new());
            let bmp = Bmp180::new(bus.clone(), SharedClock::clone(&clock), bmp_config)?;
            for measurement in [Measurement::Temperature, Measurement::Pressure, Measurement::Altitude] {
                bmp.add_observer(measurement, reporter(&tx, &clock, "bmp180", format!("{measurement:?}")));
            }
            Some(bmp)
        }
        None => None,
    };

    let _range_pins = config
        .hcsr04
        .as_ref()
        .map(|range_config| range_config.reserve_pins(&bus))
        .transpose()?;
    let range = match &config.hcsr04 {
        Some(range_config) => {
            info!(
                trigger = range_config.trigger_pin,
                echo = range_config.echo_pin,
                "range finder pins reserved, echo simulated"
            );
            let trigger = MockSwitch::new(SharedClock::clone(&clock));
            let round_trip = Duration::from_secs_f64(2.0 * OBSTACLE_M / SPEED_OF_SOUND);
            let echo = MockBinaryInput::echo_of(
                SharedClock::clone(&clock),
                &trigger,
                Duration::from_micros(250),
                round_trip,
            );
            let range = Hcsr04::new(trigger, echo, SharedClock::clone(&clock), &range_config.sensor)?;
            range.add_observer(RangeChannel::Distance, reporter(&tx, &clock, "hcsr04", "Distance".to_string()));
            Some(range)
        }
        None => None,
    };

    let mag_sim = Lsm303dlhcSim::new();
    let mag = match &config.lsm303dlhc {
        Some(mag_config) => {
            mock.attach(LSM303DLHC_MAG_ADDR, mag_sim.clone());
            mag_sim.set_field(Vector::new(EARTH_FIELD_GAUSS as f32, 0.0, -0.4));
            let mag = Lsm303dlhc::new(bus.clone(), SharedClock::clone(&clock), mag_config)?;
            let mut strength = reporter(&tx, &clock, "lsm303", "FieldStrength".to_string());
            let mut heading = reporter(&tx, &clock, "lsm303", "HeadingDeg".to_string());
            mag.add_observer(MagChannel::Field, move |field: &Vector| {
                strength(&f64::from(field.magnitude()));
                heading(&f64::from(field.y).atan2(f64::from(field.x)).to_degrees());
            });
            Some(mag)
        }
        None => None,
    };

    let pwm = match &config.pca9685 {
        Some(pwm_config) => {
            mock.attach(pwm_config.address, Pca9685Sim::new());
            Some(Pca9685::new(bus.clone(), SharedClock::clone(&clock), pwm_config)?)
        }
        None => None,
    };

    let mut pwm_outputs = Vec::new();
    for output_config in &config.pwm_outputs {
        pwm_outputs.push(GpioPwm::new(bus.clone(), SharedClock::clone(&clock), output_config)?);
    }

    let mut inputs = Vec::new();
    for input_config in &config.inputs {
        let input = GpioBinaryInput::new(bus.clone(), SharedClock::clone(&clock), input_config)?;
        let mut report = reporter(&tx, &clock, "gpio", format!("GPIO{}", input_config.pin));
        input.add_observer(
            GpioChannel::Level,
            StateChangeFilter::new(move |on: &bool| report(&if *on { 1.0 } else { 0.0 })),
        );
        inputs.push(input);
    }
    drop(tx);

    // Start every sampling loop
    let start = |result: pihwctrl::Result<()>, name: &str| {
        if let Err(e) = result {
            warn!("Failed to start {}: {}", name, e);
        }
    };
    if let Some(ads) = &ads {
        start(period.map_or_else(|| ads.start(), |p| ads.start_with_period(p)), "ads1115");
    }
    if let Some(bmp) = &bmp {
        start(period.map_or_else(|| bmp.start(), |p| bmp.start_with_period(p)), "bmp180");
    }
    if let Some(range) = &range {
        start(period.map_or_else(|| range.start(), |p| range.start_with_period(p)), "hcsr04");
    }
    if let Some(mag) = &mag {
        start(period.map_or_else(|| mag.start(), |p| mag.start_with_period(p)), "lsm303dlhc");
    }
    for input in &inputs {
        start(input.start(), "gpio");
    }

    let deadline = time::sleep(duration.unwrap_or(Duration::from_secs(u64::from(u32::MAX))));
    tokio::pin!(deadline);
    let mut stimulus = time::interval(Duration::from_millis(500));
    let mut step: u32 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping");
                break;
            }
            _ = &mut deadline => break,
            _ = stimulus.tick() => {
                // Sweep the simulated world so observers have something to report
                step = step.wrapping_add(1);
                let phase = f64::from(step % 20) / 20.0;
                ads_sim.set_voltage(Input::Ain1Gnd, (0.05 + 4.0 * phase) as f32);
                for input_config in &config.inputs {
                    mock.set_pin_level(input_config.pin, step % 4 < 2);
                }
                let angle = phase * std::f64::consts::TAU;
                mag_sim.set_field(Vector::new(
                    (EARTH_FIELD_GAUSS * angle.cos()) as f32,
                    (EARTH_FIELD_GAUSS * angle.sin()) as f32,
                    -0.4,
                ));
                if let Some(pwm) = &pwm {
                    if let Err(e) = pwm.set_duty_cycle(0, phase as f32) {
                        warn!("PWM update failed: {}", e);
                    }
                }
                for output in &pwm_outputs {
                    if let Err(e) = output.set_duty_cycle(phase as f32) {
                        warn!("GPIO{} PWM update failed: {}", output.pin(), e);
                    }
                }
            }
            reading = rx.recv() => match reading {
                Some(reading) => print_reading(&reading, json),
                None => break,
            },
        }
    }

    if let Some(ads) = &ads {
        ads.stop();
    }
    if let Some(bmp) = &bmp {
        bmp.stop();
    }
    if let Some(range) = &range {
        range.stop();
    }
    if let Some(mag) = &mag {
        mag.stop();
    }
    for input in &inputs {
        input.stop();
    }

    if !json {
        println!();
        if let Some(ads) = &ads {
            print_stats("ads1115", ads.engine().stats());
        }
        if let Some(bmp) = &bmp {
            print_stats("bmp180", bmp.engine().stats());
        }
        if let Some(range) = &range {
            print_stats("hcsr04", range.engine().stats());
        }
        if let Some(mag) = &mag {
            print_stats("lsm303", mag.engine().stats());
        }
        for input in &inputs {
            print_stats("gpio", input.engine().stats());
        }
        if let Some(pwm) = &pwm {
            println!("{:<8} channel 0 duty {:.3}", "pca9685".bold(), pwm.duty_cycle(0)?);
        }
        for output in &pwm_outputs {
            println!(
                "{:<8} GPIO{} {} cycles at {} Hz",
                "pwm".bold(),
                output.pin(),
                output.cycles(),
                output.frequency_hz()
            );
        }
        println!("Sensor rig stopped");
    }

    Ok(())
}
