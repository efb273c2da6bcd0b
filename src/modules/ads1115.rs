//! Texas Instruments ADS1115 16-bit, 4-input delta-sigma ADC.
//!
//! Every conversion is single-shot: the driver writes the multiplexer, gain
//! and data rate into the config register together with the start bit, waits
//! one conversion period, then polls the OS bit until the device reports the
//! result ready.
//!
//! With [`GainSetting::Auto`] the driver re-reads a channel with a better
//! full-scale range whenever the measured magnitude falls outside 50%..90% of
//! the current range. The gain that worked is remembered per channel, so a
//! steady signal costs a single conversion once it has settled.

use crate::bus::{Claim, Resource, SharedBus};
use crate::clock::SharedClock;
use crate::engine::SamplingEngine;
use crate::error::{BusError, Result, SensorError};
use crate::interfaces::{AnalogInput, FunctionAnalogInput};
use crate::observer::{Observable, ObserverRegistry, MAX_OBSERVED_CHANNELS};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, trace};

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

const OS_BIT: u16 = 0x8000;
const MODE_SINGLE_SHOT: u16 = 0x0100;
const COMP_QUE_DISABLE: u16 = 0x0003;

const FULL_SCALE_CODE: f32 = 32767.0;
const LOWER_BAND: f32 = 0.5;
const UPPER_BAND: f32 = 0.9;

/// How many conversion periods the OS bit may stay busy before giving up.
const READY_TIMEOUT_PERIODS: u32 = 10;

/// Level of the ADDR pin, which selects one of four bus addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AddressPin {
    #[default]
    Gnd,
    Vdd,
    Sda,
    Scl,
}

impl AddressPin {
    pub fn addr(self) -> u8 {
        match self {
            AddressPin::Gnd => 0x48,
            AddressPin::Vdd => 0x49,
            AddressPin::Sda => 0x4A,
            AddressPin::Scl => 0x4B,
        }
    }
}

/// Multiplexer setting: differential pairs and single-ended inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Input {
    Ain0Ain1,
    Ain0Ain3,
    Ain1Ain3,
    Ain2Ain3,
    Ain0Gnd,
    Ain1Gnd,
    Ain2Gnd,
    Ain3Gnd,
}

impl Input {
    pub const ALL: [Input; 8] = [
        Input::Ain0Ain1,
        Input::Ain0Ain3,
        Input::Ain1Ain3,
        Input::Ain2Ain3,
        Input::Ain0Gnd,
        Input::Ain1Gnd,
        Input::Ain2Gnd,
        Input::Ain3Gnd,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn mux_bits(self) -> u16 {
        (self.index() as u16) << 12
    }
}

impl TryFrom<u8> for Input {
    type Error = SensorError;

    fn try_from(index: u8) -> Result<Self> {
        Input::ALL
            .get(index as usize)
            .copied()
            .ok_or_else(|| SensorError::out_of_range("ADS1115 input", index))
    }
}

const_assert!(Input::ALL.len() <= MAX_OBSERVED_CHANNELS);

/// Programmable gain amplifier setting, named after the gain factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gain {
    TwoThirds,
    One,
    Two,
    Four,
    Eight,
    Sixteen,
}

/// Widest full-scale range first.
const GAIN_LADDER: [Gain; 6] = [
    Gain::TwoThirds,
    Gain::One,
    Gain::Two,
    Gain::Four,
    Gain::Eight,
    Gain::Sixteen,
];

const_assert!(GAIN_LADDER.len() == 6);

impl Gain {
    /// Full-scale range in volts.
    pub fn full_scale(self) -> f32 {
        match self {
            Gain::TwoThirds => 6.144,
            Gain::One => 4.096,
            Gain::Two => 2.048,
            Gain::Four => 1.024,
            Gain::Eight => 0.512,
            Gain::Sixteen => 0.256,
        }
    }

    fn bits(self) -> u16 {
        (self.rank() as u16) << 9
    }

    fn rank(self) -> usize {
        self as usize
    }

    /// Next wider range, if any.
    pub fn wider(self) -> Option<Gain> {
        self.rank().checked_sub(1).map(|rank| GAIN_LADDER[rank])
    }

    pub fn volts(self, raw: i16) -> f32 {
        self.full_scale() * f32::from(raw) / FULL_SCALE_CODE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GainSetting {
    Fixed(Gain),
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataRate {
    Sps8,
    Sps16,
    Sps32,
    Sps64,
    #[default]
    Sps128,
    Sps250,
    Sps475,
    Sps860,
}

impl DataRate {
    pub fn samples_per_second(self) -> u32 {
        match self {
            DataRate::Sps8 => 8,
            DataRate::Sps16 => 16,
            DataRate::Sps32 => 32,
            DataRate::Sps64 => 64,
            DataRate::Sps128 => 128,
            DataRate::Sps250 => 250,
            DataRate::Sps475 => 475,
            DataRate::Sps860 => 860,
        }
    }

    fn bits(self) -> u16 {
        (self as u16) << 5
    }

    /// Time one conversion takes at this rate, rounded up to the microsecond.
    pub fn conversion_time(self) -> Duration {
        let sps = u64::from(self.samples_per_second());
        Duration::from_micros((1_000_000 + sps - 1) / sps)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ads1115Config {
    pub address: AddressPin,
    pub data_rate: DataRate,
    /// Gain every input starts with.
    pub gain: GainSetting,
}

impl Ads1115Config {
    pub fn validate(&self) -> Result<()> {
        // Every combination of the enumerated options is a valid chip setup.
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelGain {
    setting: GainSetting,
    current: Gain,
}

impl ChannelGain {
    fn new(setting: GainSetting) -> Self {
        let current = match setting {
            GainSetting::Fixed(gain) => gain,
            GainSetting::Auto => Gain::TwoThirds,
        };
        Self { setting, current }
    }
}

/// Picks the range a reading of `raw` at `current` should be repeated with.
fn better_gain(current: Gain, raw: i16) -> Option<Gain> {
    let fraction = f32::from(raw).abs() / FULL_SCALE_CODE;
    if fraction > UPPER_BAND {
        return current.wider();
    }
    if fraction >= LOWER_BAND {
        return None;
    }

    let volts = fraction * current.full_scale();
    let best = GAIN_LADDER
        .iter()
        .rev()
        .copied()
        .find(|gain| volts <= UPPER_BAND * gain.full_scale())
        .unwrap_or(Gain::TwoThirds);
    (best != current).then_some(best)
}

struct Ads1115Inner {
    bus: SharedBus,
    clock: SharedClock,
    addr: u8,
    data_rate: DataRate,
    // Held for a whole conversion: the multiplexer is shared by all inputs.
    gains: Mutex<[ChannelGain; 8]>,
    _claim: Claim,
}

impl Ads1115Inner {
    fn read_conversion(&self, input: Input) -> Result<f32> {
        let mut gains = self.gains.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = &mut gains[input.index()];
        let mut gain = slot.current;
        let mut retries = 0;

        loop {
            let raw = self.convert(input, gain)?;
            let volts = gain.volts(raw);
            trace!(addr = self.addr, ?input, ?gain, raw, volts, "conversion");

            let next = match slot.setting {
                GainSetting::Auto => better_gain(gain, raw),
                GainSetting::Fixed(_) => None,
            };
            match next {
                Some(better) if retries < GAIN_LADDER.len() => {
                    debug!(addr = self.addr, ?input, from = ?gain, to = ?better, "auto gain step");
                    gain = better;
                    slot.current = better;
                    retries += 1;
                }
                _ => return Ok(volts),
            }
        }
    }

    fn convert(&self, input: Input, gain: Gain) -> Result<i16> {
        let config = OS_BIT
            | input.mux_bits()
            | gain.bits()
            | MODE_SINGLE_SHOT
            | self.data_rate.bits()
            | COMP_QUE_DISABLE;
        self.bus.begin(self.addr)?.write_u16_be(REG_CONFIG, config)?;

        let period = self.data_rate.conversion_time();
        self.clock.sleep(period);
        let deadline = self.clock.now() + period * READY_TIMEOUT_PERIODS;
        nb::block!(self.poll_ready(deadline))?;

        Ok(self.bus.begin(self.addr)?.read_i16_be(REG_CONVERSION)?)
    }

    fn poll_ready(&self, deadline: Duration) -> nb::Result<(), BusError> {
        let config = self.bus.begin(self.addr)?.read_u16_be(REG_CONFIG)?;
        if config & OS_BIT != 0 {
            return Ok(());
        }
        if self.clock.now() >= deadline {
            return Err(nb::Error::Other(BusError::Timeout {
                addr: self.addr,
                waited_us: (self.data_rate.conversion_time() * READY_TIMEOUT_PERIODS).as_micros()
                    as u64,
            }));
        }
        self.clock.tick();
        Err(nb::Error::WouldBlock)
    }
}

/// ADS1115 driver. Observers subscribe per [`Input`] and receive volts.
pub struct Ads1115 {
    engine: SamplingEngine<Input, f32>,
    inner: Arc<Ads1115Inner>,
}

impl Ads1115 {
    pub fn new(bus: SharedBus, clock: SharedClock, config: &Ads1115Config) -> Result<Self> {
        config.validate()?;
        let addr = config.address.addr();
        let claim = bus.claim(Resource::Device(addr), "ADS1115")?;

        let initial = ChannelGain::new(config.gain);
        // Idle state: single-shot mode, comparator disabled.
        let idle = Input::Ain0Ain1.mux_bits()
            | initial.current.bits()
            | MODE_SINGLE_SHOT
            | config.data_rate.bits()
            | COMP_QUE_DISABLE;
        bus.begin(addr)?.write_u16_be(REG_CONFIG, idle)?;
        info!(addr, rate = config.data_rate.samples_per_second(), gain = ?config.gain, "ADS1115 initialised");

        let engine = SamplingEngine::new(
            "ads1115",
            Arc::new(ObserverRegistry::new()),
            Arc::clone(&clock),
            config.data_rate.conversion_time(),
        );
        Ok(Self {
            engine,
            inner: Arc::new(Ads1115Inner {
                bus,
                clock,
                addr,
                data_rate: config.data_rate,
                gains: Mutex::new([initial; 8]),
                _claim: claim,
            }),
        })
    }

    pub fn addr(&self) -> u8 {
        self.inner.addr
    }

    /// Performs one (auto-ranged) conversion of `input`, in volts.
    pub fn read_conversion(&self, input: Input) -> Result<f32> {
        self.inner.read_conversion(input)
    }

    /// Takes effect from the next conversion on `input`.
    pub fn set_gain(&self, input: Input, setting: GainSetting) {
        let mut gains = self.inner.gains.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = &mut gains[input.index()];
        slot.setting = setting;
        if let GainSetting::Fixed(gain) = setting {
            slot.current = gain;
        }
    }

    pub fn gain_setting(&self, input: Input) -> GainSetting {
        self.inner.gains.lock().unwrap_or_else(PoisonError::into_inner)[input.index()].setting
    }

    /// The range the next conversion of `input` starts with.
    pub fn gain(&self, input: Input) -> Gain {
        self.inner.gains.lock().unwrap_or_else(PoisonError::into_inner)[input.index()].current
    }

    /// `input` as a standalone [`AnalogInput`].
    pub fn conversion_input(&self, input: Input) -> impl AnalogInput + 'static {
        let inner = Arc::clone(&self.inner);
        FunctionAnalogInput::new(move || inner.read_conversion(input))
    }

    pub fn start(&self) -> Result<()> {
        self.start_with_period(self.engine.default_period())
    }

    pub fn start_with_period(&self, period: Duration) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.engine
            .start(Some(period), move |input| inner.read_conversion(input))
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub fn engine(&self) -> &SamplingEngine<Input, f32> {
        &self.engine
    }
}

impl Observable<f32> for Ads1115 {
    type Channel = Input;

    fn observers(&self) -> &ObserverRegistry<Input, f32> {
        self.engine.observers()
    }
}

impl fmt::Debug for Ads1115 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ads1115")
            .field("addr", &self.inner.addr)
            .field("data_rate", &self.inner.data_rate)
            .finish_non_exhaustive()
    }
}
