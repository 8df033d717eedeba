//! Application controller: owns the PWM driver, the auxiliary hardware and
//! the application state, applies setpoints and runs fault recovery.
//!
//! Everything here runs on the controller task. Periodic ticks and remote
//! commands only raise event bits; the task wakes on them and calls
//! [`Controller::service`]. The one-shot power pulse and the overcurrent
//! latch reset are multi-shot timers whose deadlines the task awaits next
//! to the event bits and fires with [`Controller::poll_timers`].

use embassy_time::{Duration, Instant};

use crate::api_server::{
    parse_bool, ApiError, ApiServer, CommandQueue, PushSink, EVENT_HEARTBEAT, EVENT_STATE,
};
use crate::app_config::AppConstants;
use crate::app_state::{AppState, JsonBuf, PowerState};
use crate::board::{Board, BoardAuxHwDrv};
use crate::event_bits::{
    EventBits, EVT_CONFIG_CHANGED, EVT_STATE_CHANGED, EVT_TICK_FAST, EVT_TICK_SLOW,
};
use crate::multi_timer::MultiShotTimer;
use crate::ps_pwm::{DeadTimes, PsPwm, PsPwmConfig, PsPwmError};
use crate::settings_store::{restore_state, save_state};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    Pwm(PsPwmError),
    Api(ApiError),
}

#[cfg(feature = "defmt")]
impl defmt::Format for ControllerError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            ControllerError::Pwm(e) => defmt::write!(f, "ControllerError::Pwm({:?})", e),
            ControllerError::Api(e) => defmt::write!(f, "ControllerError::Api({:?})", e),
        }
    }
}

impl From<PsPwmError> for ControllerError {
    fn from(e: PsPwmError) -> Self {
        ControllerError::Pwm(e)
    }
}

impl From<ApiError> for ControllerError {
    fn from(e: ApiError) -> Self {
        ControllerError::Api(e)
    }
}

/// Moves `current` towards `target` by at most `increment`. Returns
/// whether it moved, which it does not for a zero increment.
///
/// The last step snaps to the target exactly, so the ramp ends on float
/// equality.
pub fn throttle_value(current: &mut f32, target: f32, increment: f32) -> bool {
    let dx = target - *current;
    if dx == 0.0 {
        return false;
    }
    let next = if dx.abs() <= increment {
        target
    } else if dx > 0.0 {
        *current + increment
    } else {
        *current - increment
    };
    // A zero rate holds the value
    if next == *current {
        return false;
    }
    log_trace!("Throttling {} to {} by {}", *current, target, increment);
    *current = next;
    true
}

/// Throttle step per fast tick; a negative one would ramp away from the
/// target.
fn increment_valid(increment: f32) -> bool {
    increment.is_finite() && increment >= 0.0
}

/// Hardware and state owned by the controller. Timer callbacks get
/// mutable access to this part only.
pub struct ControllerCore<'a, B: Board> {
    pub(crate) pwm: PsPwm<B::PwmRegs>,
    pub(crate) aux: BoardAuxHwDrv<B>,
    pub(crate) state: AppState,
    pub(crate) store: B::Store,
    pub(crate) sink: B::Sink,
    bits: &'a EventBits,
    constants: AppConstants,
    /// Output enabled with throttling, duty still ramping up
    starting: bool,
    oc_reset_pending: bool,
    snapshot: JsonBuf,
}

impl<'a, B: Board> ControllerCore<'a, B> {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn power_state(&self) -> PowerState {
        self.state.live.power_state
    }

    fn raise_state_changed(&self) {
        self.bits.raise(EVT_STATE_CHANGED);
    }

    /// Fault flags, sensor filters and setpoint throttling.
    fn on_fast_tick(&mut self) {
        self.state.live.hw_oc_fault_present = self.pwm.get_fault_present();
        self.state.live.hw_oc_fault_occurred = self.pwm.get_fault_latched();
        if let Err(e) = self.aux.update_temperatures() {
            log_error!("Temperature sensor update failed: {:?}", e);
        }
        let s = self.state.settings;
        if s.setpoint_throttling_enabled {
            let mut duty = self.pwm.setpoint().ps_duty;
            if throttle_value(&mut duty, s.duty_target, s.duty_increment) {
                self.apply_duty(duty);
            }
            let mut frequency = self.pwm.setpoint().frequency;
            if throttle_value(&mut frequency, s.frequency_target, s.frequency_increment) {
                self.apply_frequency(frequency);
            }
        }
        self.update_power_state();
    }

    fn on_slow_tick(&mut self) {
        self.evaluate_temperatures();
        self.update_power_state();
        self.push_state();
        self.sink.send("OK", EVENT_HEARTBEAT);
    }

    /// Overtemperature shutdown and fan control.
    fn evaluate_temperatures(&mut self) {
        if let Err(e) = self.aux.evaluate_temperatures() {
            log_error!("Temperature evaluation failed: {:?}", e);
        }
        if self.aux.state().hw_overtemp && self.pwm.setpoint().output_enabled {
            log_warn!("Overtemperature shutdown");
            self.pwm.disable_output();
            self.starting = false;
        }
    }

    fn apply_duty(&mut self, duty: f32) {
        if let Err(e) = self.pwm.set_ps_duty(duty) {
            log_error!("Setting duty {} failed: {:?}", duty, e);
        }
        self.raise_state_changed();
    }

    fn apply_frequency(&mut self, frequency: f32) {
        if let Err(e) = self.pwm.set_frequency(frequency) {
            log_error!("Setting frequency {} failed: {:?}", frequency, e);
        }
        self.raise_state_changed();
    }

    fn update_power_state(&mut self) {
        let enabled = self.pwm.setpoint().output_enabled;
        let s = &self.state.settings;
        if self.starting
            && (!enabled
                || !s.setpoint_throttling_enabled
                || self.pwm.setpoint().ps_duty == s.duty_target)
        {
            self.starting = false;
        }
        let power_state = if self.aux.state().hw_overtemp {
            PowerState::FaultOvertemp
        } else if self.oc_reset_pending {
            PowerState::ResettingOc
        } else if self.pwm.get_fault_latched() {
            PowerState::FaultOcLatched
        } else if !self.pwm.setpoint().output_enabled {
            PowerState::Off
        } else if self.starting {
            PowerState::Starting
        } else {
            PowerState::On
        };
        if power_state != self.state.live.power_state {
            log_info!("Power state: {}", power_state.as_str());
            self.state.live.power_state = power_state;
        }
    }

    /// Copies the driver readings into the live state.
    fn refresh_live(&mut self) {
        let sp = *self.pwm.setpoint();
        let limits = *self.pwm.setpoint_limits();
        let aux = *self.aux.state();
        let live = &mut self.state.live;
        live.frequency_min_hw = limits.frequency_min;
        live.frequency_max_hw = limits.frequency_max;
        live.dt_sum_max_hw = limits.dt_sum_max;
        live.frequency = sp.frequency;
        live.duty = sp.ps_duty;
        live.power_pwm_active = sp.output_enabled;
        live.temp_1 = aux.temp_1;
        live.temp_2 = aux.temp_2;
        live.fan_active = aux.fan_active;
        live.drv_supply_active = aux.drv_supply_active;
        live.drv_disabled = aux.drv_disabled;
        live.hw_overtemp = aux.hw_overtemp;
    }

    /// Sends the full state snapshot to the push sink.
    pub fn push_state(&mut self) {
        self.refresh_live();
        match self.state.serialize(&mut self.snapshot) {
            Ok(_) => self.sink.send(self.snapshot.as_str(), EVENT_STATE),
            Err(_) => log_error!("State snapshot does not fit the buffer"),
        }
    }

    pub fn set_setpoint_throttling_enabled(&mut self, enabled: bool) {
        self.state.settings.setpoint_throttling_enabled = enabled;
        self.update_power_state();
        self.raise_state_changed();
    }

    /// Clamps the target into the user range and applies it right away
    /// when throttling is off.
    fn retarget_frequency(&mut self, frequency: f32) {
        let s = &mut self.state.settings;
        s.frequency_target = frequency.max(s.frequency_min).min(s.frequency_max);
        if !s.setpoint_throttling_enabled {
            let target = s.frequency_target;
            self.apply_frequency(target);
        }
    }

    fn retarget_duty(&mut self, duty: f32) {
        let s = &mut self.state.settings;
        s.duty_target = duty.max(s.duty_min).min(s.duty_max);
        if !s.setpoint_throttling_enabled {
            let target = s.duty_target;
            self.apply_duty(target);
        }
    }

    fn frequency_range_valid(&self, min: f32, max: f32) -> bool {
        let hw = self.pwm.setpoint_limits();
        min.is_finite()
            && max.is_finite()
            && min > hw.frequency_min
            && max <= hw.frequency_max
            && min <= max
    }

    pub fn set_frequency_min_khz(&mut self, value: f32) {
        let min = value * 1e3;
        if self.frequency_range_valid(min, self.state.settings.frequency_max) {
            self.state.settings.frequency_min = min;
            self.retarget_frequency(self.state.settings.frequency_target);
        } else {
            log_error!("Rejected frequency minimum: {} kHz", value);
        }
        self.raise_state_changed();
    }

    pub fn set_frequency_max_khz(&mut self, value: f32) {
        let max = value * 1e3;
        if self.frequency_range_valid(self.state.settings.frequency_min, max) {
            self.state.settings.frequency_max = max;
            self.retarget_frequency(self.state.settings.frequency_target);
        } else {
            log_error!("Rejected frequency maximum: {} kHz", value);
        }
        self.raise_state_changed();
    }

    pub fn set_frequency_khz(&mut self, value: f32) {
        if value.is_finite() {
            self.retarget_frequency(value * 1e3);
        } else {
            log_error!("Rejected frequency: {} kHz", value);
        }
        self.raise_state_changed();
    }

    pub fn set_frequency_changerate_khz_s(&mut self, value: f32) {
        let increment = value * 1e3 * self.constants.t_fast_s();
        if increment_valid(increment) {
            self.state.settings.frequency_increment = increment;
        } else {
            log_error!("Rejected frequency change rate: {} kHz/s", value);
        }
        self.raise_state_changed();
    }

    fn duty_range_valid(min: f32, max: f32) -> bool {
        (0.0..=1.0).contains(&min) && (0.0..=1.0).contains(&max) && min <= max
    }

    pub fn set_duty_min_percent(&mut self, value: f32) {
        let min = value / 100.0;
        if Self::duty_range_valid(min, self.state.settings.duty_max) {
            self.state.settings.duty_min = min;
            self.retarget_duty(self.state.settings.duty_target);
        } else {
            log_error!("Rejected duty minimum: {} %", value);
        }
        self.raise_state_changed();
    }

    pub fn set_duty_max_percent(&mut self, value: f32) {
        let max = value / 100.0;
        if Self::duty_range_valid(self.state.settings.duty_min, max) {
            self.state.settings.duty_max = max;
            self.retarget_duty(self.state.settings.duty_target);
        } else {
            log_error!("Rejected duty maximum: {} %", value);
        }
        self.raise_state_changed();
    }

    pub fn set_duty_percent(&mut self, value: f32) {
        if value.is_finite() {
            self.retarget_duty(value / 100.0);
        } else {
            log_error!("Rejected duty: {} %", value);
        }
        self.update_power_state();
        self.raise_state_changed();
    }

    pub fn set_duty_changerate_percent_s(&mut self, value: f32) {
        let increment = value / 100.0 * self.constants.t_fast_s();
        if increment_valid(increment) {
            self.state.settings.duty_increment = increment;
        } else {
            log_error!("Rejected duty change rate: {} %/s", value);
        }
        self.raise_state_changed();
    }

    fn set_dead_times(&mut self, lead: f32, lag: f32) -> Result<(), PsPwmError> {
        self.pwm.set_dead_times(DeadTimes::symmetric(lead, lag))?;
        self.state.settings.lead_dt = lead;
        self.state.settings.lag_dt = lag;
        Ok(())
    }

    pub fn set_lead_dt_ns(&mut self, value: f32) {
        let lag = self.pwm.setpoint().lag_red;
        if let Err(e) = self.set_dead_times(value * 1e-9, lag) {
            log_error!("Rejected lead leg dead time {} ns: {:?}", value, e);
        }
        self.raise_state_changed();
    }

    pub fn set_lag_dt_ns(&mut self, value: f32) {
        let lead = self.pwm.setpoint().lead_red;
        if let Err(e) = self.set_dead_times(lead, value * 1e-9) {
            log_error!("Rejected lag leg dead time {} ns: {:?}", value, e);
        }
        self.raise_state_changed();
    }

    /// Enables or disables the power output. Enabling is refused while any
    /// fault is latched and starts from zero duty when throttling is on.
    /// Enabling an active output changes nothing.
    pub fn set_power_pwm_active(&mut self, active: bool) {
        if !active {
            self.pwm.disable_output();
            self.starting = false;
        } else if self.pwm.setpoint().output_enabled {
            log_debug!("Power output already active");
        } else if self.aux.state().hw_overtemp {
            log_error!("Overtemperature shutdown still active!");
        } else if self.oc_reset_pending || self.pwm.get_fault_latched() {
            log_error!("Overcurrent shutdown still active!");
        } else {
            let throttling = self.state.settings.setpoint_throttling_enabled;
            if throttling {
                // Soft start from zero
                if let Err(e) = self.pwm.set_ps_duty(0.0) {
                    log_error!("Resetting duty failed: {:?}", e);
                }
            }
            match self.pwm.resync_enable_output() {
                Ok(()) => self.starting = throttling,
                Err(e) => log_error!("Enabling power output failed: {:?}", e),
            }
        }
        self.update_power_state();
        self.raise_state_changed();
    }

    pub fn set_oneshot_len_s(&mut self, value: f32) {
        let ms = value * 1e3;
        if ms.is_finite() && ms >= 0.0 && ms <= u32::MAX as f32 {
            self.state.settings.oneshot_len_ms = num_traits::float::FloatCore::round(ms) as u32;
        } else {
            log_error!("Rejected one-shot pulse length: {} s", value);
        }
        self.raise_state_changed();
    }

    pub fn set_current_limit(&mut self, value: f32) {
        if let Err(e) = self.aux.set_current_limit(value) {
            log_error!("Rejected current limit {} A: {:?}", value, e);
        }
        self.state.settings.current_limit = self.aux.state().current_limit;
        self.raise_state_changed();
    }

    pub fn set_temp_1_limit(&mut self, value: f32) {
        if let Err(e) = self.aux.set_temp_1_limit(value) {
            log_error!("Rejected temperature 1 limit {} °C: {:?}", value, e);
        }
        self.state.settings.temp_1_limit = self.aux.state().temp_1_limit;
        self.raise_state_changed();
    }

    pub fn set_temp_2_limit(&mut self, value: f32) {
        if let Err(e) = self.aux.set_temp_2_limit(value) {
            log_error!("Rejected temperature 2 limit {} °C: {:?}", value, e);
        }
        self.state.settings.temp_2_limit = self.aux.state().temp_2_limit;
        self.raise_state_changed();
    }

    pub fn set_relay_ref_active(&mut self, active: bool) {
        if let Err(e) = self.aux.set_relay_ref_active(active) {
            log_error!("Relay REF: {:?}", e);
        }
        self.state.settings.relay_ref_active = self.aux.state().relay_ref_active;
        self.raise_state_changed();
    }

    pub fn set_relay_dut_active(&mut self, active: bool) {
        if let Err(e) = self.aux.set_relay_dut_active(active) {
            log_error!("Relay DUT: {:?}", e);
        }
        self.state.settings.relay_dut_active = self.aux.state().relay_dut_active;
        self.raise_state_changed();
    }

    pub fn set_fan_override(&mut self, active: bool) {
        if let Err(e) = self.aux.set_fan_override(active) {
            log_error!("Fan override: {:?}", e);
        }
        self.state.settings.fan_override = self.aux.state().fan_override;
        self.raise_state_changed();
    }

    /// Persists the user settings.
    pub fn save_settings(&mut self) {
        self.refresh_live();
        if let Err(e) = save_state(&self.state, &mut self.store, self.constants.settings_name) {
            log_error!("Saving settings failed: {:?}", e);
        }
        self.raise_state_changed();
    }

    /// Loads the persisted settings and applies them to the hardware.
    /// Defaults stay in place for a missing or unreadable blob.
    pub fn restore_settings(&mut self) {
        log_info!("Restoring state from {}", self.constants.settings_name);
        // Errors are logged by the store
        let _ = restore_state(&mut self.state, &mut self.store, self.constants.settings_name);
        self.sanitize_ranges();
        let s = self.state.settings;
        self.set_frequency_khz(s.frequency_target / 1e3);
        self.set_duty_percent(s.duty_target * 100.0);
        if let Err(e) = self.set_dead_times(s.lead_dt, s.lag_dt) {
            log_error!("Stored dead times rejected: {:?}", e);
            self.state.settings.lead_dt = self.pwm.setpoint().lead_red;
            self.state.settings.lag_dt = self.pwm.setpoint().lag_red;
        }
        self.set_current_limit(s.current_limit);
        self.set_relay_ref_active(s.relay_ref_active);
        self.set_relay_dut_active(s.relay_dut_active);
        self.set_fan_override(s.fan_override);
        self.set_temp_1_limit(s.temp_1_limit);
        self.set_temp_2_limit(s.temp_2_limit);
        if let Err(e) = self.aux.update_temperatures() {
            log_error!("Temperature sensor update failed: {:?}", e);
        }
        self.evaluate_temperatures();
        log_info!("Activating gate driver power supply");
        if let Err(e) = self.aux.set_drv_supply_active(true) {
            log_error!("Gate driver supply: {:?}", e);
        }
        self.update_power_state();
    }

    /// Falls back to the defaults for stored ranges and change rates that
    /// a setter would refuse.
    fn sanitize_ranges(&mut self) {
        let s = self.state.settings;
        let defaults = crate::app_state::Settings::new(&self.constants);
        if !s.frequency_target.is_finite() {
            self.state.settings.frequency_target = defaults.frequency_target;
        }
        if !s.duty_target.is_finite() {
            self.state.settings.duty_target = defaults.duty_target;
        }
        if !increment_valid(s.frequency_increment) {
            log_warn!("Stored frequency change rate invalid, using default");
            self.state.settings.frequency_increment = defaults.frequency_increment;
        }
        if !increment_valid(s.duty_increment) {
            log_warn!("Stored duty change rate invalid, using default");
            self.state.settings.duty_increment = defaults.duty_increment;
        }
        if !self.frequency_range_valid(s.frequency_min, s.frequency_max) {
            log_warn!("Stored frequency range invalid, using defaults");
            self.state.settings.frequency_min = self.constants.frequency_min;
            self.state.settings.frequency_max = self.constants.frequency_max;
        }
        if !Self::duty_range_valid(s.duty_min, s.duty_max) {
            log_warn!("Stored duty range invalid, using defaults");
            self.state.settings.duty_min = defaults.duty_min;
            self.state.settings.duty_max = defaults.duty_max;
        }
    }

    /// Clears the overtemperature latch and evaluates the sensors again,
    /// which sets it right back if still too hot. Returns whether an
    /// overcurrent latch reset is needed.
    fn clear_overtemp(&mut self) -> bool {
        self.aux.clear_overtemp();
        self.evaluate_temperatures();
        self.state.live.hw_oc_fault_occurred
    }

    fn oneshot_step(_timer: &mut MultiShotTimer<Self>, core: &mut Self, count: u32) {
        log_debug!("Power pulse step {}", count);
        core.set_power_pwm_active(count == 1);
    }

    /// Reset pulse for the external overcurrent latch, then the internal
    /// latch. The output stays disabled.
    fn oc_reset_step(_timer: &mut MultiShotTimer<Self>, core: &mut Self, count: u32) {
        log_debug!("Overcurrent reset step {}", count);
        let result = match count {
            1 => core.aux.oc_reset_start(),
            2 => core.aux.oc_reset_finish(),
            _ => {
                core.pwm.clear_fault_latched();
                core.oc_reset_pending = false;
                core.state.live.hw_oc_fault_present = core.pwm.get_fault_present();
                core.state.live.hw_oc_fault_occurred = core.pwm.get_fault_latched();
                log_info!("Overcurrent latch reset done");
                core.update_power_state();
                core.raise_state_changed();
                Ok(())
            }
        };
        if let Err(e) = result {
            log_error!("Overcurrent reset line: {:?}", e);
        }
    }
}

pub struct Controller<'a, B: Board> {
    core: ControllerCore<'a, B>,
    oneshot_timer: MultiShotTimer<ControllerCore<'a, B>>,
    oc_reset_timer: MultiShotTimer<ControllerCore<'a, B>>,
    api: ApiServer<Controller<'a, B>>,
    now: Instant,
}

impl<'a, B: Board> Controller<'a, B> {
    /// Starts the PWM driver with the outputs off and registers the
    /// command handlers. Call [`ControllerCore::restore_settings`] through
    /// [`Controller::begin`] before servicing events.
    pub fn new(
        pwm_regs: B::PwmRegs,
        aux: BoardAuxHwDrv<B>,
        store: B::Store,
        sink: B::Sink,
        constants: &AppConstants,
        bits: &'a EventBits,
    ) -> Result<Self, ControllerError> {
        log_info!("Configuring phase-shift PWM");
        let pwm = PsPwm::new(
            pwm_regs,
            &PsPwmConfig {
                mode: constants.pwm_mode,
                clk_conf: constants.clk_conf,
                frequency: constants.init_frequency,
                ps_duty: constants.init_ps_duty,
                dead_times: DeadTimes::symmetric(constants.init_lead_dt, constants.init_lag_dt),
                output_enabled: constants.init_power_pwm_active,
                disable_action_lead_leg: constants.disable_action_lead_leg,
                disable_action_lag_leg: constants.disable_action_lag_leg,
                fault_polarity: Some(constants.fault_pin_active_level),
            },
        )?;
        let mut api = ApiServer::new();
        Self::register_api(&mut api)?;
        Ok(Self {
            core: ControllerCore {
                pwm,
                aux,
                state: AppState::new(constants),
                store,
                sink,
                bits,
                constants: *constants,
                starting: false,
                oc_reset_pending: false,
                snapshot: JsonBuf::new(),
            },
            oneshot_timer: MultiShotTimer::new(),
            oc_reset_timer: MultiShotTimer::new(),
            api,
            now: Instant::from_ticks(0),
        })
    }

    /// Restores the persisted settings.
    pub fn begin(&mut self, now: Instant) {
        self.now = now;
        self.core.restore_settings();
    }

    pub fn core(&self) -> &ControllerCore<'a, B> {
        &self.core
    }

    #[cfg(test)]
    pub(crate) fn core_mut(&mut self) -> &mut ControllerCore<'a, B> {
        &mut self.core
    }

    pub fn state(&self) -> &AppState {
        &self.core.state
    }

    pub fn api(&self) -> &ApiServer<Controller<'a, B>> {
        &self.api
    }

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (
            self.oneshot_timer.next_deadline(),
            self.oc_reset_timer.next_deadline(),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fires every due timer call.
    pub fn poll_timers(&mut self, now: Instant) {
        self.now = now;
        loop {
            let oneshot = self.oneshot_timer.poll(now, &mut self.core);
            let oc_reset = self.oc_reset_timer.poll(now, &mut self.core);
            if !oneshot && !oc_reset {
                break;
            }
        }
    }

    /// Handles the event bits taken by one wake, in the order fast tick,
    /// slow tick, state change, queued commands. State changes raised
    /// while handling the ticks are coalesced into the same snapshot.
    pub fn service(&mut self, now: Instant, bits: u8, commands: &CommandQueue) {
        self.now = now;
        if bits & EVT_TICK_FAST != 0 {
            self.core.on_fast_tick();
        }
        let mut pushed = false;
        if bits & EVT_TICK_SLOW != 0 {
            self.core.on_slow_tick();
            pushed = true;
        }
        let state_changed = bits & EVT_STATE_CHANGED != 0
            || self.core.bits.take_only(EVT_STATE_CHANGED) != 0;
        if state_changed && !pushed {
            self.core.push_state();
        }
        if bits & EVT_CONFIG_CHANGED != 0 {
            while let Ok(cmd) = commands.try_receive() {
                self.handle_command(now, &cmd.name, &cmd.arg);
            }
        }
    }

    /// Runs the command `name`. Returns false for unknown commands.
    pub fn handle_command(&mut self, now: Instant, name: &str, arg: &str) -> bool {
        self.now = now;
        let Some(handler) = self.api.lookup(name) else {
            log_warn!("API: unknown command: {}", name);
            return false;
        };
        log_debug!("API: {} = {}", name, arg);
        handler.invoke(self, arg);
        true
    }

    /// Power output pulse of the configured length.
    pub fn trigger_oneshot(&mut self) {
        let len = self.core.state.settings.oneshot_len_ms;
        log_debug!("Power pulse, {} ms", len);
        // The callback raises the state change
        self.oneshot_timer.schedule(
            self.now,
            Duration::from_millis(len as u64),
            2,
            ControllerCore::oneshot_step,
        );
    }

    /// Clears the overtemperature latch and starts the overcurrent latch
    /// reset sequence if an overcurrent fault occurred. The output is not
    /// enabled again.
    ///
    /// The fault input is not checked before the reset: the board has no
    /// separate overcurrent detect line, so an input still asserted cannot
    /// be told apart from the latched state.
    pub fn clear_shutdown(&mut self) {
        if self.core.clear_overtemp() {
            let pulse_ms = self.core.aux.config().oc_reset_pulse_length_ms;
            self.core.oc_reset_pending = true;
            self.oc_reset_timer.schedule(
                self.now,
                Duration::from_millis(pulse_ms as u64),
                3,
                ControllerCore::oc_reset_step,
            );
        } else {
            self.core.raise_state_changed();
        }
        self.core.update_power_state();
    }

    fn register_api(api: &mut ApiServer<Self>) -> Result<(), ApiError> {
        api.register_str("set_setpoint_throttling_enabled", |c, v| {
            c.core.set_setpoint_throttling_enabled(parse_bool(v))
        })?;
        api.register_float("set_frequency_min", |c, v| c.core.set_frequency_min_khz(v))?;
        api.register_float("set_frequency_max", |c, v| c.core.set_frequency_max_khz(v))?;
        api.register_float("set_frequency", |c, v| c.core.set_frequency_khz(v))?;
        api.register_float("set_frequency_changerate", |c, v| {
            c.core.set_frequency_changerate_khz_s(v)
        })?;
        api.register_float("set_duty_min", |c, v| c.core.set_duty_min_percent(v))?;
        api.register_float("set_duty_max", |c, v| c.core.set_duty_max_percent(v))?;
        api.register_float("set_duty", |c, v| c.core.set_duty_percent(v))?;
        api.register_float("set_duty_changerate", |c, v| {
            c.core.set_duty_changerate_percent_s(v)
        })?;
        api.register_float("set_lag_dt", |c, v| c.core.set_lag_dt_ns(v))?;
        api.register_float("set_lead_dt", |c, v| c.core.set_lead_dt_ns(v))?;
        api.register_str("set_power_pwm_active", |c, v| {
            c.core.set_power_pwm_active(parse_bool(v))
        })?;
        api.register_float("set_oneshot_len", |c, v| c.core.set_oneshot_len_s(v))?;
        api.register_void("trigger_oneshot", |c| c.trigger_oneshot())?;
        api.register_void("clear_shutdown", |c| c.clear_shutdown())?;
        api.register_float("set_current_limit", |c, v| c.core.set_current_limit(v))?;
        api.register_float("set_temp_1_limit", |c, v| c.core.set_temp_1_limit(v))?;
        api.register_float("set_temp_2_limit", |c, v| c.core.set_temp_2_limit(v))?;
        api.register_str("set_relay_ref_active", |c, v| {
            c.core.set_relay_ref_active(parse_bool(v))
        })?;
        api.register_str("set_relay_dut_active", |c, v| {
            c.core.set_relay_dut_active(parse_bool(v))
        })?;
        api.register_str("set_fan_override", |c, v| c.core.set_fan_override(parse_bool(v)))?;
        api.register_void("save_settings", |c| c.core.save_settings())?;
        Ok(())
    }
}
