// stats.rs

use crate::*;

/// Samples below this are a sensor error, not a temperature.
pub const MIN_VALID_TEMP: f32 = -30.0;
/// How far a sample must extend min or max before the envelope moves.
pub const EXTREME_HYSTERESIS: f32 = 1.0;
/// How far the current value must move before it is redrawn.
pub const CURRENT_HYSTERESIS: f32 = 0.1;

/// Which display regions need to be repainted after an update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedrawFlags {
    pub min: bool,
    pub max: bool,
    pub current: bool,
}

impl RedrawFlags {
    pub const NONE: RedrawFlags = RedrawFlags {
        min: false,
        max: false,
        current: false,
    };
    pub const ALL: RedrawFlags = RedrawFlags {
        min: true,
        max: true,
        current: true,
    };
}

/// Current temperature plus hysteretic min/max envelopes.
///
/// The min/max values are not true running extrema: they only follow a
/// sample that extends them by at least [`EXTREME_HYSTERESIS`], which
/// keeps the slow display from being repainted on every small wobble.
#[derive(Clone, Debug)]
pub struct StatsTracker {
    current: f32,
    min: f32,
    max: f32,
    last_displayed: f32,
    full_redraw: bool,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTracker {
    pub fn new() -> Self {
        StatsTracker {
            current: 0.0,
            min: 0.0,
            max: 0.0,
            last_displayed: 0.0,
            full_redraw: true,
        }
    }

    pub fn update(&mut self, sample: f32) -> RedrawFlags {
        if sample.is_nan() || sample < MIN_VALID_TEMP {
            warn!("Discarding invalid temperature {sample}");
            return RedrawFlags::NONE;
        }

        self.current = sample;
        if self.full_redraw {
            self.full_redraw = false;
            self.min = sample;
            self.max = sample;
            self.last_displayed = sample;
            return RedrawFlags::ALL;
        }

        let mut flags = RedrawFlags::NONE;
        if sample < self.min && (self.min - sample).abs() >= EXTREME_HYSTERESIS {
            self.min = sample;
            flags.min = true;
        }
        if sample > self.max && (sample - self.max).abs() >= EXTREME_HYSTERESIS {
            self.max = sample;
            flags.max = true;
        }
        if (sample - self.last_displayed).abs() >= CURRENT_HYSTERESIS {
            self.last_displayed = sample;
            flags.current = true;
        }
        flags
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn needs_full_redraw(&self) -> bool {
        self.full_redraw
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn last_displayed(&self) -> f32 {
        self.last_displayed
    }

    pub fn values(&self) -> TempValues {
        TempValues {
            temperature: self.current,
            temperature_min: self.min,
            temperature_max: self.max,
        }
    }
}


// EOF
