use pihwctrl::mock::{MockBus, MockClock};
use pihwctrl::modules::{AddressPin, DataRate, Gain, GainSetting, Input};
use pihwctrl::sim::Ads1115Sim;
use pihwctrl::*;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const LADDER: [Gain; 6] = [
    Gain::TwoThirds,
    Gain::One,
    Gain::Two,
    Gain::Four,
    Gain::Eight,
    Gain::Sixteen,
];

fn adc(sim: &Ads1115Sim) -> Ads1115 {
    let mock = MockBus::strict();
    mock.attach(0x48, sim.clone());
    Ads1115::new(SharedBus::new(mock), MockClock::shared(), &Ads1115Config::default()).unwrap()
}

fn start_auto_at(adc: &Ads1115, input: Input, gain: Gain) {
    adc.set_gain(input, GainSetting::Fixed(gain));
    adc.set_gain(input, GainSetting::Auto);
    assert_eq!(adc.gain(input), gain);
}

#[test]
fn test_in_band_code_keeps_every_starting_gain() {
    let sim = Ads1115Sim::new();
    sim.set_fixed_code(Some(20_000));
    let adc = adc(&sim);

    for gain in LADDER {
        start_auto_at(&adc, Input::Ain0Gnd, gain);
        let before = sim.conversions();
        let volts = adc.read_conversion(Input::Ain0Gnd).unwrap();

        assert_eq!(sim.conversions() - before, 1, "{gain:?}");
        assert_eq!(adc.gain(Input::Ain0Gnd), gain);
        assert!((volts - gain.volts(20_000)).abs() < 1e-6);
    }
}

#[test]
fn test_saturated_code_walks_to_widest_range() {
    let sim = Ads1115Sim::new();
    sim.set_fixed_code(Some(i16::MAX));
    let adc = adc(&sim);

    for (rank, gain) in LADDER.into_iter().enumerate() {
        start_auto_at(&adc, Input::Ain1Gnd, gain);
        let before = sim.conversions();
        let volts = adc.read_conversion(Input::Ain1Gnd).unwrap();

        assert_eq!(sim.conversions() - before, rank as u32 + 1, "{gain:?}");
        assert_eq!(adc.gain(Input::Ain1Gnd), Gain::TwoThirds);
        assert!((volts - 6.144).abs() < 1e-4);
    }
}

#[test]
fn test_tiny_code_settles_on_narrowest_range() {
    let sim = Ads1115Sim::new();
    sim.set_fixed_code(Some(-100));
    let adc = adc(&sim);

    for gain in LADDER {
        start_auto_at(&adc, Input::Ain2Ain3, gain);
        let before = sim.conversions();
        let volts = adc.read_conversion(Input::Ain2Ain3).unwrap();

        let expected = if gain == Gain::Sixteen { 1 } else { 2 };
        assert_eq!(sim.conversions() - before, expected, "{gain:?}");
        assert_eq!(adc.gain(Input::Ain2Ain3), Gain::Sixteen);
        assert!(volts < 0.0);
    }
}

#[test]
fn test_auto_gain_is_idempotent() {
    let sim = Ads1115Sim::new();
    let adc = adc(&sim);

    for volts in [0.01, 0.2, 0.7, 1.5, 3.0, 5.5] {
        sim.set_voltage(Input::Ain3Gnd, volts);
        let first = adc.read_conversion(Input::Ain3Gnd).unwrap();
        let settled = adc.gain(Input::Ain3Gnd);

        let before = sim.conversions();
        let second = adc.read_conversion(Input::Ain3Gnd).unwrap();
        assert_eq!(sim.conversions() - before, 1, "{volts} V");
        assert_eq!(adc.gain(Input::Ain3Gnd), settled);
        assert_eq!(first, second);
        assert!((second - volts).abs() < volts * 0.01 + 1e-3, "{volts} V read as {second}");
    }
}

#[test]
fn test_inputs_keep_independent_gains() {
    let sim = Ads1115Sim::new();
    sim.set_voltage(Input::Ain0Gnd, 0.1);
    sim.set_voltage(Input::Ain1Gnd, 3.0);
    let adc = adc(&sim);

    adc.read_conversion(Input::Ain0Gnd).unwrap();
    adc.read_conversion(Input::Ain1Gnd).unwrap();

    assert_eq!(adc.gain(Input::Ain0Gnd), Gain::Sixteen);
    assert_eq!(adc.gain(Input::Ain1Gnd), Gain::One);
    assert_eq!(adc.gain(Input::Ain0Ain1), Gain::TwoThirds);
}

#[test]
fn test_address_pin_selects_device() {
    let sim = Ads1115Sim::new();
    sim.set_voltage(Input::Ain0Gnd, 1.0);
    let mock = MockBus::strict();
    mock.attach(0x4B, sim.clone());
    let config = Ads1115Config {
        address: AddressPin::Scl,
        data_rate: DataRate::Sps860,
        gain: GainSetting::Fixed(Gain::Two),
    };
    let adc = Ads1115::new(SharedBus::new(mock), MockClock::shared(), &config).unwrap();

    assert_eq!(adc.addr(), 0x4B);
    assert!((adc.read_conversion(Input::Ain0Gnd).unwrap() - 1.0).abs() < 1e-3);
    assert_eq!(sim.config() & 0x00E0, 0x00E0);
}

#[test]
fn test_missing_device_is_a_bus_error() {
    let result = Ads1115::new(
        SharedBus::new(MockBus::strict()),
        MockClock::shared(),
        &Ads1115Config::default(),
    );
    assert_eq!(
        result.unwrap_err(),
        SensorError::Bus(BusError::Nack { addr: 0x48 })
    );
}

#[test]
fn test_transient_fault_propagates_to_direct_caller() {
    let sim = Ads1115Sim::new();
    let mock = MockBus::strict();
    mock.attach(0x48, sim.clone());
    let adc = Ads1115::new(SharedBus::new(mock.clone()), MockClock::shared(), &Ads1115Config::default())
        .unwrap();

    mock.inject_faults(1, BusError::Io("glitch".to_string()));
    assert!(adc.read_conversion(Input::Ain0Gnd).is_err());
    assert!(adc.read_conversion(Input::Ain0Gnd).is_ok());
}

#[test]
fn test_sampling_loop_notifies_only_observed_inputs() {
    let sim = Ads1115Sim::new();
    sim.set_voltage(Input::Ain0Gnd, 1.25);
    sim.set_voltage(Input::Ain3Gnd, 2.5);
    let adc = adc(&sim);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    adc.add_observer(Input::Ain3Gnd, move |volts: &f32| sink.lock().unwrap().push(*volts));

    adc.start().unwrap();
    for _ in 0..20_000 {
        if seen.lock().unwrap().len() >= 3 {
            break;
        }
        thread::sleep(Duration::from_micros(100));
    }
    adc.stop();

    let seen = seen.lock().unwrap();
    assert!(seen.len() >= 3);
    assert!(seen.iter().all(|volts| (volts - 2.5).abs() < 1e-3));
    assert_eq!(adc.gain(Input::Ain0Gnd), Gain::TwoThirds);
}

#[test]
fn test_mean_filter_over_conversion_input() {
    let sim = Ads1115Sim::new();
    sim.set_voltage(Input::Ain0Gnd, 1.0);
    let adc = adc(&sim);
    let filtered = MeanFilter::new(adc.conversion_input(Input::Ain0Gnd), 4).unwrap();

    assert!((filtered.read_value().unwrap() - 1.0).abs() < 1e-3);
    sim.set_voltage(Input::Ain0Gnd, 2.0);
    let mean = filtered.read_value().unwrap();
    assert!((mean - 1.25).abs() < 1e-3, "{mean}");
}

#[test]
fn test_direct_reads_and_sampling_loop_never_cross_inputs() {
    let sim = Ads1115Sim::new();
    sim.set_voltage(Input::Ain0Gnd, 1.25);
    sim.set_voltage(Input::Ain3Gnd, 2.5);
    let adc = Arc::new(adc(&sim));

    let sampled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sampled);
    adc.add_observer(Input::Ain3Gnd, move |volts: &f32| sink.lock().unwrap().push(*volts));
    adc.start().unwrap();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let adc = Arc::clone(&adc);
            thread::spawn(move || {
                (0..200)
                    .map(|_| adc.read_conversion(Input::Ain0Gnd).unwrap())
                    .collect::<Vec<f32>>()
            })
        })
        .collect();
    let direct: Vec<f32> = readers
        .into_iter()
        .flat_map(|reader| reader.join().unwrap())
        .collect();

    for _ in 0..20_000 {
        if sampled.lock().unwrap().len() >= 20 {
            break;
        }
        thread::sleep(Duration::from_micros(100));
    }
    adc.stop();

    assert_eq!(direct.len(), 400);
    assert!(direct.iter().all(|volts| (volts - 1.25).abs() < 1e-3));
    let sampled = sampled.lock().unwrap();
    assert!(sampled.len() >= 20);
    assert!(sampled.iter().all(|volts| (volts - 2.5).abs() < 1e-3));
}
