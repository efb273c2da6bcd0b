use pihwctrl::controls::MeanFilter;
use pihwctrl::mock::{MockBus, MockClock};
use pihwctrl::modules::lsm303dlhc::LSM303DLHC_MAG_ADDR;
use pihwctrl::modules::{MagChannel, MagGain, MagGainSetting, OutputRate};
use pihwctrl::sim::Lsm303dlhcSim;
use pihwctrl::*;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn magnetometer(config: &Lsm303dlhcConfig) -> (Lsm303dlhc, Lsm303dlhcSim, MockBus) {
    let mock = MockBus::strict();
    let sim = Lsm303dlhcSim::new();
    mock.attach(LSM303DLHC_MAG_ADDR, sim.clone());
    let mag = Lsm303dlhc::new(SharedBus::new(mock.clone()), MockClock::shared(), config).unwrap();
    (mag, sim, mock)
}

fn close(a: Vector, b: Vector, tolerance: f32) -> bool {
    (a.x - b.x).abs() < tolerance && (a.y - b.y).abs() < tolerance && (a.z - b.z).abs() < tolerance
}

#[test]
fn test_weak_field_walks_down_one_range_per_reading() {
    let (mag, sim, _mock) = magnetometer(&Lsm303dlhcConfig::default());
    mag.set_gain(MagGainSetting::Fixed(MagGain::G8_1)).unwrap();
    mag.set_gain(MagGainSetting::Auto).unwrap();
    let field = Vector::new(0.1, -0.2, 0.15);
    sim.set_field(field);

    let mut path = vec![mag.gain()];
    for _ in 0..8 {
        let reading = mag.read_magnetic_field().unwrap();
        assert!(close(reading, field, 0.01), "{reading} at {:?}", path.last());
        path.push(mag.gain());
    }
    path.dedup();

    assert_eq!(
        path,
        vec![
            MagGain::G8_1,
            MagGain::G5_6,
            MagGain::G4_7,
            MagGain::G4,
            MagGain::G2_5,
            MagGain::G1_9,
            MagGain::G1_3,
        ]
    );
}

#[test]
fn test_sampling_loop_reports_the_field() {
    let config = Lsm303dlhcConfig {
        rate: OutputRate::Hz220,
        ..Lsm303dlhcConfig::default()
    };
    let (mag, sim, _mock) = magnetometer(&config);
    let field = Vector::new(0.3, 0.1, -0.4);
    sim.set_field(field);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    mag.add_observer(MagChannel::Field, move |value: &Vector| sink.lock().unwrap().push(*value));

    assert_eq!(mag.engine().default_period(), OutputRate::Hz220.period());
    mag.start().unwrap();
    for _ in 0..20_000 {
        if seen.lock().unwrap().len() >= 5 {
            break;
        }
        thread::sleep(Duration::from_micros(100));
    }
    mag.stop();

    let seen = seen.lock().unwrap();
    assert!(seen.len() >= 5);
    assert!(seen.iter().all(|value| close(*value, field, 0.005)), "{seen:?}");
    assert!(sim.output_reads() >= 5);
}

#[test]
fn test_bus_faults_are_counted_and_sampling_continues() {
    let (mag, sim, mock) = magnetometer(&Lsm303dlhcConfig::default());
    sim.set_field(Vector::new(0.2, 0.2, 0.2));

    let values = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&values);
    mag.add_observer(MagChannel::Field, move |_: &Vector| *sink.lock().unwrap() += 1);

    mock.inject_faults(3, BusError::Nack { addr: LSM303DLHC_MAG_ADDR });
    mag.start_with_period(Duration::from_millis(1)).unwrap();
    for _ in 0..20_000 {
        if *values.lock().unwrap() >= 2 {
            break;
        }
        thread::sleep(Duration::from_micros(100));
    }
    mag.stop();

    assert!(*values.lock().unwrap() >= 2);
    assert_eq!(mag.engine().stats().failures, 3);
    assert_eq!(mock.fault_stats().faults_injected, 3);
}

#[test]
fn test_field_strength_input_feeds_mean_filter() {
    let (mag, sim, _mock) = magnetometer(&Lsm303dlhcConfig::default());
    sim.set_field(Vector::new(0.3, 0.0, -0.4));

    let strength = MeanFilter::new(mag.field_strength_input(), 4).unwrap();
    let value = strength.read_value().unwrap();
    assert!((value - 0.5).abs() < 5e-3, "{value}");
}

#[test]
fn test_second_driver_on_same_bus_is_refused() {
    let mock = MockBus::strict();
    mock.attach(LSM303DLHC_MAG_ADDR, Lsm303dlhcSim::new());
    let bus = SharedBus::new(mock);

    let first = Lsm303dlhc::new(bus.clone(), MockClock::shared(), &Lsm303dlhcConfig::default()).unwrap();
    assert_eq!(
        Lsm303dlhc::new(bus.clone(), MockClock::shared(), &Lsm303dlhcConfig::default()).unwrap_err(),
        SensorError::ModuleAlreadyInUse("LSM303DLHC-0x1E".to_string())
    );

    drop(first);
    assert!(Lsm303dlhc::new(bus, MockClock::shared(), &Lsm303dlhcConfig::default()).is_ok());
}

#[test]
fn test_direct_reads_and_sampling_loop_agree_on_gain() {
    let (mag, sim, _mock) = magnetometer(&Lsm303dlhcConfig::default());
    let mag = Arc::new(mag);
    // Overflows the narrowest range, so the first reading moves the gain.
    let field = Vector::new(2.0, -0.8, 0.6);
    sim.set_field(field);

    let sampled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sampled);
    mag.add_observer(MagChannel::Field, move |value: &Vector| sink.lock().unwrap().push(*value));
    mag.start_with_period(Duration::from_micros(100)).unwrap();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let mag = Arc::clone(&mag);
            thread::spawn(move || {
                (0..200)
                    .filter_map(|_| mag.read_magnetic_field().ok())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let direct: Vec<Vector> = readers
        .into_iter()
        .flat_map(|reader| reader.join().unwrap())
        .collect();
    mag.stop();

    // Every value was scaled with the gain it was converted at.
    assert_eq!(mag.gain(), MagGain::G1_9);
    assert!(!direct.is_empty());
    assert!(direct.iter().all(|value| close(*value, field, 0.01)), "{direct:?}");
    assert!(sampled
        .lock()
        .unwrap()
        .iter()
        .all(|value| close(*value, field, 0.01)));
}
