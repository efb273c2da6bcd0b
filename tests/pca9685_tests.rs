use pihwctrl::mock::{MockBus, MockClock};
use pihwctrl::sim::Pca9685Sim;
use pihwctrl::*;

const TICK: f32 = 1.0 / 4096.0;

fn controller(address: u8) -> (Pca9685, Pca9685Sim) {
    let mock = MockBus::strict();
    let sim = Pca9685Sim::new();
    mock.attach(address, sim.clone());
    let config = Pca9685Config {
        address,
        ..Pca9685Config::default()
    };
    let pwm = Pca9685::new(SharedBus::new(mock), MockClock::shared(), &config).unwrap();
    (pwm, sim)
}

#[test]
fn test_set_then_get_duty_cycle_within_one_tick() {
    let (pwm, _sim) = controller(0x40);
    pwm.set_duty_cycle(12, 0.7).unwrap();
    assert!((pwm.duty_cycle(12).unwrap() - 0.7).abs() <= TICK);
}

#[test]
fn test_every_channel_is_independent() {
    let (pwm, sim) = controller(0x41);
    for channel in 0..16u8 {
        pwm.set_duty_cycle(channel, f32::from(channel) / 16.0).unwrap();
    }
    for channel in 0..16u8 {
        let expected = f32::from(channel) / 16.0;
        assert!((pwm.duty_cycle(channel).unwrap() - expected).abs() <= TICK);
    }
    assert_eq!(sim.channel(8), (0, 2048));
}

#[test]
fn test_full_on_and_full_off_use_the_full_bit() {
    let (pwm, sim) = controller(0x40);

    pwm.set_duty_cycle(0, 1.0).unwrap();
    assert_eq!(sim.channel(0), (0x1000, 0));
    assert_eq!(pwm.duty_cycle(0).unwrap(), 1.0);

    pwm.set_duty_cycle(0, 0.0).unwrap();
    assert_eq!(sim.channel(0), (0, 0x1000));
    assert_eq!(pwm.duty_cycle(0).unwrap(), 0.0);
}

#[test]
fn test_device_registers_are_the_source_of_truth() {
    let mock = MockBus::strict();
    let sim = Pca9685Sim::new();
    mock.attach(0x40, sim.clone());
    let bus = SharedBus::new(mock);
    let pwm = Pca9685::new(bus.clone(), MockClock::shared(), &Pca9685Config::default()).unwrap();

    // Another master reprograms channel 5 behind the driver's back.
    bus.begin(0x40)
        .unwrap()
        .write(0x06 + 4 * 5, &[0x00, 0x02, 0x00, 0x06])
        .unwrap();
    assert!((pwm.duty_cycle(5).unwrap() - 0.25).abs() < f32::EPSILON);
}

#[test]
fn test_pwm_capability_objects() {
    let (pwm, _sim) = controller(0x40);
    let outputs: Vec<Box<dyn Pwm>> = (0..4)
        .map(|channel| Box::new(pwm.as_pwm(channel).unwrap()) as Box<dyn Pwm>)
        .collect();

    for (index, output) in outputs.iter().enumerate() {
        output.set_duty_cycle(0.1 * index as f32).unwrap();
    }
    assert!((pwm.duty_cycle(3).unwrap() - 0.3).abs() <= TICK);
    assert!(outputs[2].set_duty_cycle(1.01).is_err());
}

#[test]
fn test_frequency_reprogramming() {
    let (pwm, sim) = controller(0x40);
    pwm.set_frequency(50.0).unwrap();
    assert_eq!(sim.prescale(), 121);
    assert!((pwm.frequency().unwrap() - 50.0).abs() < 0.5);
    assert!(matches!(
        pwm.set_frequency(10.0),
        Err(SensorError::OutOfRange { what: "PWM frequency", .. })
    ));
}

#[test]
fn test_one_driver_per_address() {
    let mock = MockBus::new();
    let bus = SharedBus::new(mock);
    let clock = MockClock::shared();
    let _first = Pca9685::new(bus.clone(), clock.clone(), &Pca9685Config::default()).unwrap();

    assert_eq!(
        Pca9685::new(bus, clock, &Pca9685Config::default()).unwrap_err(),
        SensorError::ModuleAlreadyInUse("PCA9685-0x40".to_string())
    );
}
