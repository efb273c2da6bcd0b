use crate::error::{Result, SensorError};
use crate::interfaces::AnalogInput;
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
struct Window {
    samples: Vec<f32>,
    next: usize,
    mean: f32,
    primed: bool,
}

/// Running mean over the last `size` readings of the wrapped input.
///
/// The window is primed with the first reading, so the first call returns
/// that reading and later calls slide the window by one sample each.
#[derive(Debug)]
pub struct MeanFilter<I> {
    input: I,
    window: Mutex<Window>,
}

impl<I: AnalogInput> MeanFilter<I> {
    pub fn new(input: I, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SensorError::out_of_range("mean filter size", 0u32));
        }
        Ok(Self {
            input,
            window: Mutex::new(Window {
                samples: vec![0.0; size],
                next: 0,
                mean: 0.0,
                primed: false,
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .samples
            .len()
    }

    pub fn inner(&self) -> &I {
        &self.input
    }
}

impl<I: AnalogInput> AnalogInput for MeanFilter<I> {
    fn read_value(&self) -> Result<f32> {
        let value = self.input.read_value()?;
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);

        if !window.primed {
            window.samples.fill(value);
            window.mean = value;
            window.primed = true;
            return Ok(value);
        }

        let size = window.samples.len();
        let slot = window.next;
        window.mean += (value - window.samples[slot]) / size as f32;
        window.samples[slot] = value;
        window.next = (slot + 1) % size;
        Ok(window.mean)
    }
}
