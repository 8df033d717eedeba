//! Application state: persisted user settings plus live values, and their
//! JSON encoding.
//!
//! Values are kept in SI units internally and scaled at the JSON boundary:
//! kHz, kHz/s, %, %/s, ns, A, °C and s.

use heapless::String;
use num_traits::float::FloatCore;
use serde::{Deserialize, Serialize};

use crate::app_config::AppConstants;

/// Error of the settings decoder
pub type DecodeError = serde_json_core::de::Error;
/// Error of the snapshot encoder
pub type EncodeError = serde_json_core::ser::Error;

/// Every key of the full state snapshot, in output order.
pub const STATE_KEYS: [&str; 35] = [
    "setpoint_throttling_enabled",
    "base_div",
    "timer_div",
    "frequency_min_hw",
    "frequency_max_hw",
    "frequency_min",
    "frequency_max",
    "frequency",
    "frequency_target",
    "frequency_changerate",
    "duty_min",
    "duty_max",
    "duty",
    "duty_target",
    "duty_changerate",
    "dt_sum_max_hw",
    "lead_dt",
    "lag_dt",
    "current_limit",
    "temp_1_limit",
    "temp_2_limit",
    "temp_1",
    "temp_2",
    "fan_active",
    "fan_override",
    "relay_ref_active",
    "relay_dut_active",
    "drv_supply_active",
    "drv_disabled",
    "power_pwm_active",
    "hw_oc_fault_present",
    "hw_oc_fault",
    "hw_overtemp",
    "power_state",
    "oneshot_len",
];

const fn total_len(keys: &[&str]) -> usize {
    let mut sum = 0;
    let mut i = 0;
    while i < keys.len() {
        sum += keys[i].len();
        i += 1;
    }
    sum
}

/// Longest value: a shortest round-trip `f32` is at most 16 characters,
/// the power state name 18
const MAX_VALUE_LEN: usize = 24;
/// Quotes around the key, colon and separator
const MEMBER_OVERHEAD: usize = 4;

/// Upper bound of the serialized state length
pub const JSON_BUF_LEN: usize =
    2 + total_len(&STATE_KEYS) + STATE_KEYS.len() * (MEMBER_OVERHEAD + MAX_VALUE_LEN) + 16;

pub type JsonBuf = String<JSON_BUF_LEN>;

/// Power output state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    Off,
    /// Duty ramping up from zero
    Starting,
    On,
    FaultOcLatched,
    FaultOvertemp,
    ResettingOc,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Off => "off",
            PowerState::Starting => "starting",
            PowerState::On => "on",
            PowerState::FaultOcLatched => "fault_oc_latched",
            PowerState::FaultOvertemp => "fault_overtemp",
            PowerState::ResettingOc => "resetting_oc",
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            PowerState::FaultOcLatched | PowerState::FaultOvertemp | PowerState::ResettingOc
        )
    }
}

/// Runtime user settings, persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub setpoint_throttling_enabled: bool,
    pub frequency_min: f32,
    pub frequency_max: f32,
    pub frequency_target: f32,
    /// Hz per fast tick
    pub frequency_increment: f32,
    pub duty_min: f32,
    pub duty_max: f32,
    pub duty_target: f32,
    /// Duty fraction per fast tick
    pub duty_increment: f32,
    pub lead_dt: f32,
    pub lag_dt: f32,
    pub current_limit: f32,
    pub temp_1_limit: f32,
    pub temp_2_limit: f32,
    pub relay_ref_active: bool,
    pub relay_dut_active: bool,
    pub fan_override: bool,
    pub oneshot_len_ms: u32,
}

impl Settings {
    pub fn new(c: &AppConstants) -> Self {
        Self {
            setpoint_throttling_enabled: true,
            frequency_min: c.frequency_min,
            frequency_max: c.frequency_max,
            frequency_target: c.init_frequency,
            frequency_increment: 500.0,
            duty_min: 0.0,
            duty_max: 0.8,
            duty_target: 0.0,
            duty_increment: 0.05,
            lead_dt: c.init_lead_dt,
            lag_dt: c.init_lag_dt,
            current_limit: 8.0,
            temp_1_limit: 50.0,
            temp_2_limit: 50.0,
            relay_ref_active: false,
            relay_dut_active: false,
            fan_override: false,
            oneshot_len_ms: 1,
        }
    }
}

/// Live values, mirrored from the drivers before each snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveState {
    pub base_div: u32,
    pub timer_div: u32,
    pub frequency_min_hw: f32,
    pub frequency_max_hw: f32,
    pub dt_sum_max_hw: f32,
    pub frequency: f32,
    pub duty: f32,
    pub temp_1: f32,
    pub temp_2: f32,
    pub fan_active: bool,
    pub drv_supply_active: bool,
    pub drv_disabled: bool,
    pub power_pwm_active: bool,
    pub hw_oc_fault_present: bool,
    pub hw_oc_fault_occurred: bool,
    pub hw_overtemp: bool,
    pub power_state: PowerState,
}

impl LiveState {
    /// Safe state: faults set until the first clear.
    pub fn new(c: &AppConstants) -> Self {
        Self {
            base_div: c.clk_conf.base_clk_prescale,
            timer_div: c.clk_conf.timer_clk_prescale,
            frequency_min_hw: 0.0,
            frequency_max_hw: 0.0,
            dt_sum_max_hw: 0.0,
            frequency: c.init_frequency,
            duty: 0.0,
            temp_1: 150.0,
            temp_2: 150.0,
            fan_active: true,
            drv_supply_active: true,
            drv_disabled: false,
            power_pwm_active: false,
            hw_oc_fault_present: true,
            hw_oc_fault_occurred: true,
            hw_overtemp: true,
            power_state: PowerState::FaultOvertemp,
        }
    }
}

pub struct AppState {
    pub settings: Settings,
    pub live: LiveState,
    t_fast_s: f32,
}

impl AppState {
    pub fn new(c: &AppConstants) -> Self {
        Self {
            settings: Settings::new(c),
            live: LiveState::new(c),
            t_fast_s: c.t_fast_s(),
        }
    }

    /// Snapshot record in the units of the remote API.
    fn snapshot(&self) -> StateSnapshot {
        let s = &self.settings;
        let l = &self.live;
        StateSnapshot {
            setpoint_throttling_enabled: s.setpoint_throttling_enabled,
            base_div: l.base_div,
            timer_div: l.timer_div,
            frequency_min_hw: l.frequency_min_hw / 1e3,
            frequency_max_hw: l.frequency_max_hw / 1e3,
            frequency_min: s.frequency_min / 1e3,
            frequency_max: s.frequency_max / 1e3,
            frequency: l.frequency / 1e3,
            frequency_target: s.frequency_target / 1e3,
            frequency_changerate: s.frequency_increment / self.t_fast_s / 1e3,
            duty_min: s.duty_min * 100.0,
            duty_max: s.duty_max * 100.0,
            duty: l.duty * 100.0,
            duty_target: s.duty_target * 100.0,
            duty_changerate: s.duty_increment / self.t_fast_s * 100.0,
            dt_sum_max_hw: l.dt_sum_max_hw * 1e9,
            lead_dt: s.lead_dt * 1e9,
            lag_dt: s.lag_dt * 1e9,
            current_limit: s.current_limit,
            temp_1_limit: s.temp_1_limit,
            temp_2_limit: s.temp_2_limit,
            temp_1: l.temp_1,
            temp_2: l.temp_2,
            fan_active: l.fan_active,
            fan_override: s.fan_override,
            relay_ref_active: s.relay_ref_active,
            relay_dut_active: s.relay_dut_active,
            drv_supply_active: l.drv_supply_active,
            drv_disabled: l.drv_disabled,
            power_pwm_active: l.power_pwm_active,
            hw_oc_fault_present: l.hw_oc_fault_present,
            hw_oc_fault: l.hw_oc_fault_occurred,
            hw_overtemp: l.hw_overtemp,
            power_state: l.power_state,
            oneshot_len: s.oneshot_len_ms as f32 / 1e3,
        }
    }

    /// Writes the full state snapshot into `out`, returns its length.
    /// Non-finite values are written as `null`.
    pub fn serialize(&self, out: &mut JsonBuf) -> Result<usize, EncodeError> {
        *out = serde_json_core::to_string(&self.snapshot())?;
        Ok(out.len())
    }

    /// Restores the user settings from a snapshot. Live values and unknown
    /// keys are skipped, missing and `null` keys keep their current value.
    /// Nothing is changed if the input does not parse.
    pub fn deserialize_settings(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        // Fixed-size buffers may carry NUL padding
        let len = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        let (record, _) = serde_json_core::from_slice::<SettingsRecord>(&bytes[..len])?;
        let t_fast_s = self.t_fast_s;
        let s = &mut self.settings;
        if let Some(v) = record.setpoint_throttling_enabled {
            s.setpoint_throttling_enabled = v;
        }
        if let Some(v) = record.frequency_min {
            s.frequency_min = v * 1e3;
        }
        if let Some(v) = record.frequency_max {
            s.frequency_max = v * 1e3;
        }
        if let Some(v) = record.frequency_target {
            s.frequency_target = v * 1e3;
        }
        if let Some(v) = record.frequency_changerate {
            s.frequency_increment = v * 1e3 * t_fast_s;
        }
        if let Some(v) = record.duty_min {
            s.duty_min = v / 100.0;
        }
        if let Some(v) = record.duty_max {
            s.duty_max = v / 100.0;
        }
        if let Some(v) = record.duty_target {
            s.duty_target = v / 100.0;
        }
        if let Some(v) = record.duty_changerate {
            s.duty_increment = v / 100.0 * t_fast_s;
        }
        if let Some(v) = record.lead_dt {
            s.lead_dt = v / 1e9;
        }
        if let Some(v) = record.lag_dt {
            s.lag_dt = v / 1e9;
        }
        if let Some(v) = record.current_limit {
            s.current_limit = v;
        }
        if let Some(v) = record.temp_1_limit {
            s.temp_1_limit = v;
        }
        if let Some(v) = record.temp_2_limit {
            s.temp_2_limit = v;
        }
        if let Some(v) = record.relay_ref_active {
            s.relay_ref_active = v;
        }
        if let Some(v) = record.relay_dut_active {
            s.relay_dut_active = v;
        }
        if let Some(v) = record.fan_override {
            s.fan_override = v;
        }
        if let Some(v) = record.oneshot_len {
            let ms = FloatCore::round(v * 1e3);
            s.oneshot_len_ms = if ms > 0.0 { ms as u32 } else { 0 };
        }
        Ok(())
    }
}

/// Full state as sent to the remote, keys in output order.
#[derive(Debug, Serialize)]
struct StateSnapshot {
    setpoint_throttling_enabled: bool,
    base_div: u32,
    timer_div: u32,
    frequency_min_hw: f32,
    frequency_max_hw: f32,
    frequency_min: f32,
    frequency_max: f32,
    frequency: f32,
    frequency_target: f32,
    frequency_changerate: f32,
    duty_min: f32,
    duty_max: f32,
    duty: f32,
    duty_target: f32,
    duty_changerate: f32,
    dt_sum_max_hw: f32,
    lead_dt: f32,
    lag_dt: f32,
    current_limit: f32,
    temp_1_limit: f32,
    temp_2_limit: f32,
    temp_1: f32,
    temp_2: f32,
    fan_active: bool,
    fan_override: bool,
    relay_ref_active: bool,
    relay_dut_active: bool,
    drv_supply_active: bool,
    drv_disabled: bool,
    power_pwm_active: bool,
    hw_oc_fault_present: bool,
    hw_oc_fault: bool,
    hw_overtemp: bool,
    power_state: PowerState,
    oneshot_len: f32,
}

/// The restorable members of a stored snapshot.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsRecord {
    setpoint_throttling_enabled: Option<bool>,
    frequency_min: Option<f32>,
    frequency_max: Option<f32>,
    frequency_target: Option<f32>,
    frequency_changerate: Option<f32>,
    duty_min: Option<f32>,
    duty_max: Option<f32>,
    duty_target: Option<f32>,
    duty_changerate: Option<f32>,
    lead_dt: Option<f32>,
    lag_dt: Option<f32>,
    current_limit: Option<f32>,
    temp_1_limit: Option<f32>,
    temp_2_limit: Option<f32>,
    relay_ref_active: Option<bool>,
    relay_dut_active: Option<bool>,
    fan_override: Option<bool>,
    oneshot_len: Option<f32>,
}
