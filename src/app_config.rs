//! Compile-time configuration of the converter firmware.
//!
//! Pin assignments are owned by the board binary; everything else that is
//! fixed at build time lives here.

use crate::ps_pwm::{ClkConf, DisableAction, FaultPolarity, PwmMode};

/// Application constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppConstants {
    /// Fast timer for ADC acquisition and setpoint throttling
    pub timer_fast_interval_ms: u32,
    /// Cyclic state push interval, also the temperature evaluation interval
    pub timer_slow_interval_ms: u32,
    /// Blob name of the persisted runtime settings
    pub settings_name: &'static str,

    pub pwm_mode: PwmMode,
    pub clk_conf: ClkConf,
    // Lead leg might have a different configuration than the lag leg
    pub disable_action_lead_leg: DisableAction,
    pub disable_action_lag_leg: DisableAction,
    pub fault_pin_active_level: FaultPolarity,

    // Default runtime frequency setpoint limits
    pub frequency_min: f32,
    pub frequency_max: f32,
    pub init_frequency: f32,
    pub init_ps_duty: f32,
    pub init_lead_dt: f32,
    pub init_lag_dt: f32,
    // Output must start in "off" state
    pub init_power_pwm_active: bool,
}

impl AppConstants {
    pub const fn new() -> Self {
        Self {
            timer_fast_interval_ms: 50,
            timer_slow_interval_ms: 500,
            settings_name: "settings.json",
            pwm_mode: PwmMode::UpCounting,
            clk_conf: ClkConf::new(160_000_000, 4, 4),
            disable_action_lead_leg: DisableAction::ForceLow,
            disable_action_lag_leg: DisableAction::ForceLow,
            fault_pin_active_level: FaultPolarity::ActiveLow,
            frequency_min: 50e3,
            frequency_max: 300e3,
            init_frequency: 100e3,
            init_ps_duty: 0.45,
            init_lead_dt: 125e-9,
            init_lag_dt: 125e-9,
            init_power_pwm_active: false,
        }
    }

    /// Fast tick interval in seconds
    pub fn t_fast_s(&self) -> f32 {
        self.timer_fast_interval_ms as f32 * 1e-3
    }
}

impl Default for AppConstants {
    fn default() -> Self {
        Self::new()
    }
}

pub const APP_CONSTANTS: AppConstants = AppConstants::new();

/// Auxiliary hardware configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuxHwConfig {
    // Threshold values for activating/deactivating the fan in automatic mode
    pub temp_1_fan_threshold_hi: f32,
    pub temp_1_fan_threshold_lo: f32,
    pub temp_2_fan_threshold_hi: f32,
    pub temp_2_fan_threshold_lo: f32,
    /// Overcurrent latch reset pulse length, also the step of the reset sequence
    pub oc_reset_pulse_length_ms: u32,
    /// Current limit in A which corresponds to full duty of the reference PWM
    pub curr_limit_full_scale: f32,
    /// Reference PWM duty offset in counts
    pub curr_limit_pwm_offset: u16,
}

impl AuxHwConfig {
    pub const fn new() -> Self {
        Self {
            temp_1_fan_threshold_hi: 45.0,
            temp_1_fan_threshold_lo: 40.0,
            temp_2_fan_threshold_hi: 45.0,
            temp_2_fan_threshold_lo: 40.0,
            oc_reset_pulse_length_ms: 10,
            curr_limit_full_scale: 100.0,
            curr_limit_pwm_offset: 0,
        }
    }
}

impl Default for AuxHwConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub const AUX_HW_CONFIG: AuxHwConfig = AuxHwConfig::new();
