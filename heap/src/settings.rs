use std::time::Duration;

use thiserror::Error;

use crate::state::MAX_SUSPEND_TIME;

/// Upper bound for parallel sweep helpers.
pub const MAX_SWEEP_ASSISTANTS: usize = 64;

/// Tuning knobs of a [`crate::GcRuntime`].
#[derive(Debug, Clone)]
pub struct GcSettings {
    /// Committed allocation volume that requests the first collection.
    pub trigger_bytes: usize,
    /// After a cycle the next trigger is `max(trigger_bytes, live * target_growth)`.
    pub target_growth: f64,
    /// Threads sweeping fixed block pages next to the collector.
    pub sweep_assistants: usize,
    /// Empty pages kept per store after a cycle; the rest is unmapped.
    pub retained_empty_pages: usize,
    /// How long a scheduled collection waits for a suspended gate.
    pub suspend_timeout: Duration,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            trigger_bytes: 64 * 1024 * 1024, // 64 MB
            target_growth: 2.0,
            sweep_assistants: 0,
            retained_empty_pages: 4,
            suspend_timeout: MAX_SUSPEND_TIME,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("trigger_bytes must be > 0")]
    ZeroTrigger,
    #[error("target_growth must be a finite value >= 1.0, got {0}")]
    InvalidGrowth(f64),
    #[error("at most {MAX_SWEEP_ASSISTANTS} sweep assistants are supported, got {0}")]
    TooManyAssistants(usize),
    #[error("suspend_timeout must be non-zero")]
    ZeroSuspendTimeout,
}

impl GcSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.trigger_bytes == 0 {
            return Err(SettingsError::ZeroTrigger);
        }
        if !self.target_growth.is_finite() || self.target_growth < 1.0 {
            return Err(SettingsError::InvalidGrowth(self.target_growth));
        }
        if self.sweep_assistants > MAX_SWEEP_ASSISTANTS {
            return Err(SettingsError::TooManyAssistants(self.sweep_assistants));
        }
        if self.suspend_timeout.is_zero() {
            return Err(SettingsError::ZeroSuspendTimeout);
        }
        Ok(())
    }

    /// Overlays the fields set in `info` onto the defaults.
    pub fn from_info(info: &GcCreateInfo) -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        info.trigger_bytes.inspect(|&v| settings.trigger_bytes = v);
        info.target_growth.inspect(|&v| settings.target_growth = v);
        info.sweep_assistants.inspect(|&v| settings.sweep_assistants = v);
        info.retained_empty_pages
            .inspect(|&v| settings.retained_empty_pages = v);
        info.suspend_timeout.inspect(|&v| settings.suspend_timeout = v);
        settings.validate()?;
        Ok(settings)
    }

    /// Trigger for the cycle after one that left `live_bytes` allocated.
    pub fn next_trigger(&self, live_bytes: usize) -> usize {
        let grown = (live_bytes as f64 * self.target_growth) as usize;
        grown.max(self.trigger_bytes)
    }
}

/// Partial settings, e.g. from command line flags.
#[derive(Debug, Default, Clone)]
pub struct GcCreateInfo {
    pub trigger_bytes: Option<usize>,
    pub target_growth: Option<f64>,
    pub sweep_assistants: Option<usize>,
    pub retained_empty_pages: Option<usize>,
    pub suspend_timeout: Option<Duration>,
}
