//! Phase-shift PWM generator for a full-bridge power stage.
//!
//! The peripheral model has two timers, each driving one operator with two
//! complementary outputs (A: low side, B: high side of one bridge leg).
//! Timer 0 drives the leading leg and is the phase reference. Timer 1 drives
//! the lagging leg and is synchronized to timer 0; its phase register sets
//! the phase shift and with it the rectified duty cycle.
//!
//! Two counting modes are supported and selected at init:
//!
//! - [`PwmMode::UpCounting`]: hardware dead-band generator with four
//!   independent dead times. Maximum frequency is highest. The waveform is
//!   only DC-free when `red + fed` of both legs match.
//! - [`PwmMode::UpDownCounting`]: dead times are produced by the compare
//!   registers, symmetric per leg. Strictly DC-free, half the maximum
//!   frequency.
//!
//! A software-forced one-shot trip drives all outputs to their safe level.
//! It stays in effect until [`PsPwm::resync_enable_output`] clears it.
//! The hardware fault input shares the same one-shot trip.
//!
//! All multi-register updates happen inside a critical section.

use num_traits::float::FloatCore;

/// Minimum timer TOP value (counts)
pub const TIMER_TOP_MIN: u32 = 2;
/// Timer period and dead-band registers are 16 bits wide
pub const REG_MAX: u32 = u16::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PwmMode {
    UpCounting,
    UpDownCounting,
}

/// Output level forced onto both pins of a leg while tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisableAction {
    /// Keep the last level
    NoChange,
    ForceLow,
    ForceHigh,
}

/// Electrical level of the hardware fault input which trips the outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FaultPolarity {
    ActiveLow,
    ActiveHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timer {
    /// Reference timer, leading leg
    T0,
    /// Phase-shifted timer, lagging leg
    T1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Compare {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PsPwmError {
    /// Frequency not finite or outside of the hardware limits
    FrequencyOutOfRange,
    /// Phase-shift duty not in [0, 1]
    DutyOutOfRange,
    /// Dead time negative, or rising plus falling edge not below the period
    DeadTimeOutOfRange,
    /// Output cannot be enabled while a hardware fault is latched
    FaultLatched,
}

/// Register access to the PWM peripheral.
///
/// Implementations write registers only; all values are pre-validated
/// counts. The driver calls these from inside a critical section.
pub trait PwmRegisters {
    /// Program base clock (dead-band) and timer clock prescalers.
    fn set_prescalers(&mut self, base_clk_prescale: u32, timer_clk_prescale: u32);
    /// Counting mode, generator actions, timer 1 sync to timer 0 and start.
    fn setup_timers(&mut self, mode: PwmMode);
    /// One-shot trip sources (software, hardware fault 0) and safe levels.
    fn setup_fault_handler(&mut self, lead: DisableAction, lag: DisableAction);
    fn set_period(&mut self, timer: Timer, top: u16);
    fn set_phase(&mut self, timer: Timer, phase: u16);
    fn period(&self, timer: Timer) -> u16;
    fn set_compare(&mut self, timer: Timer, cmp: Compare, value: u16);
    /// Rising and falling edge delay in base clock counts.
    fn set_dead_band(&mut self, timer: Timer, red: u16, fed: u16);
    /// Pulse the software one-shot force bit of one operator.
    fn force_one_shot(&mut self, timer: Timer);
    /// Pulse the one-shot clear bit of one operator.
    fn clear_one_shot(&mut self, timer: Timer);
    /// Pulse the software sync bit, reloading the counter from the phase register.
    fn sync_software(&mut self, timer: Timer);
    fn enable_hw_fault(&mut self, polarity: FaultPolarity);
    fn disable_hw_fault(&mut self);
    /// Instantaneous state of the hardware fault input
    fn hw_fault_present(&self) -> bool;
    /// Sticky hardware fault event flag
    fn hw_fault_event(&self) -> bool;
    fn clear_hw_fault_event(&mut self);
}

/// Clock prescaler configuration; immutable after init.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClkConf {
    pub input_clk: u32,
    pub base_clk_prescale: u32,
    pub timer_clk_prescale: u32,
    /// Dead-band generator clock (Hz)
    pub base_clk: f32,
    /// Timer counting clock (Hz)
    pub timer_clk: f32,
}

impl ClkConf {
    pub const fn new(input_clk: u32, base_clk_prescale: u32, timer_clk_prescale: u32) -> Self {
        let base = input_clk / base_clk_prescale;
        let timer = base / timer_clk_prescale;
        Self {
            input_clk,
            base_clk_prescale,
            timer_clk_prescale,
            base_clk: base as f32,
            timer_clk: timer as f32,
        }
    }
}

/// Hardware setpoint limits, derived from the clock configuration and the
/// current frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetpointLimits {
    pub frequency_min: f32,
    pub frequency_max: f32,
    /// Maximum of rising plus falling edge dead time, per leg (s)
    pub dt_sum_max: f32,
}

/// Setpoints currently programmed into the peripheral.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Setpoint {
    pub frequency: f32,
    pub ps_duty: f32,
    pub lead_red: f32,
    pub lead_fed: f32,
    pub lag_red: f32,
    pub lag_fed: f32,
    pub output_enabled: bool,
}

/// Per-leg dead times in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeadTimes {
    pub lead_red: f32,
    pub lead_fed: f32,
    pub lag_red: f32,
    pub lag_fed: f32,
}

impl DeadTimes {
    pub fn symmetric(lead: f32, lag: f32) -> Self {
        Self {
            lead_red: lead,
            lead_fed: lead,
            lag_red: lag,
            lag_fed: lag,
        }
    }
}

/// Init parameters. Output pins and the fault input pin are routed by the
/// board before the registers are handed to the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsPwmConfig {
    pub mode: PwmMode,
    pub clk_conf: ClkConf,
    pub frequency: f32,
    pub ps_duty: f32,
    pub dead_times: DeadTimes,
    pub output_enabled: bool,
    pub disable_action_lead_leg: DisableAction,
    pub disable_action_lag_leg: DisableAction,
    /// `None` leaves the hardware fault input disconnected
    pub fault_polarity: Option<FaultPolarity>,
}

/// Register values derived from one consistent set of setpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimingRegs {
    top: u16,
    phase: u16,
    lead_cmp_a: u16,
    lead_cmp_b: u16,
    lag_cmp_a: u16,
    lag_cmp_b: u16,
    lead_red: u16,
    lead_fed: u16,
    lag_red: u16,
    lag_fed: u16,
}

/// Phase-shift PWM driver owning one peripheral unit.
pub struct PsPwm<R: PwmRegisters> {
    regs: R,
    mode: PwmMode,
    clk_conf: ClkConf,
    limits: SetpointLimits,
    setpoint: Setpoint,
    fault_latched: bool,
}

impl<R: PwmRegisters> PsPwm<R> {
    /// Validates the initial setpoints, configures the peripheral and
    /// starts the timers with the outputs tripped. Outputs are enabled at
    /// the end if `config.output_enabled` is set.
    pub fn new(regs: R, config: &PsPwmConfig) -> Result<Self, PsPwmError> {
        log_debug!("ps_pwm: init, mode {:?}", config.mode);
        let clk_conf = config.clk_conf;
        let (frequency_min, frequency_max) = frequency_limits(config.mode, &clk_conf);
        let mut pwm = Self {
            regs,
            mode: config.mode,
            clk_conf,
            limits: SetpointLimits {
                frequency_min,
                frequency_max,
                dt_sum_max: 0.0,
            },
            setpoint: Setpoint {
                frequency: config.frequency,
                ps_duty: config.ps_duty,
                lead_red: 0.0,
                lead_fed: 0.0,
                lag_red: 0.0,
                lag_fed: 0.0,
                output_enabled: false,
            },
            fault_latched: false,
        };
        pwm.check_frequency(config.frequency)?;
        check_duty(config.ps_duty)?;
        pwm.limits.dt_sum_max = dt_sum_max(&clk_conf, config.frequency);
        let dead_times = pwm.normalize(config.dead_times);
        pwm.check_dead_times(&dead_times, pwm.limits.dt_sum_max)?;
        pwm.store_dead_times(&dead_times);
        log_debug!(
            "ps_pwm: frequency_min {} frequency_max {} dt_sum_max {}",
            pwm.limits.frequency_min,
            pwm.limits.frequency_max,
            pwm.limits.dt_sum_max
        );

        let timing = pwm.compute_timing(config.frequency, config.ps_duty, &dead_times);
        critical_section::with(|_| {
            let regs = &mut pwm.regs;
            regs.set_prescalers(clk_conf.base_clk_prescale, clk_conf.timer_clk_prescale);
            regs.setup_fault_handler(config.disable_action_lead_leg, config.disable_action_lag_leg);
            // Outputs go to the safe level before the timers start running
            regs.force_one_shot(Timer::T0);
            regs.force_one_shot(Timer::T1);
            regs.setup_timers(config.mode);
        });
        pwm.write_timing(&timing);
        if let Some(polarity) = config.fault_polarity {
            pwm.enable_hw_fault_shutdown(polarity);
        }
        if config.output_enabled {
            pwm.resync_enable_output()?;
        }
        log_info!("ps_pwm: init OK, top {} phase {}", timing.top, timing.phase);
        Ok(pwm)
    }

    pub fn mode(&self) -> PwmMode {
        self.mode
    }

    pub fn clk_conf(&self) -> &ClkConf {
        &self.clk_conf
    }

    pub fn setpoint_limits(&self) -> &SetpointLimits {
        &self.limits
    }

    pub fn setpoint(&self) -> &Setpoint {
        &self.setpoint
    }

    /// Sets the switching frequency. Compare values and phase are
    /// recomputed from the memoized dead times and phase-shift duty.
    pub fn set_frequency(&mut self, frequency: f32) -> Result<(), PsPwmError> {
        self.check_frequency(frequency)?;
        let dt_sum_max = dt_sum_max(&self.clk_conf, frequency);
        let dead_times = self.dead_times();
        // Current dead times must still fit into the new period
        self.check_dead_times(&dead_times, dt_sum_max)?;
        let timing = self.compute_timing(frequency, self.setpoint.ps_duty, &dead_times);
        self.write_timing(&timing);
        self.setpoint.frequency = frequency;
        self.limits.dt_sum_max = dt_sum_max;
        log_debug!("ps_pwm: timer top {} phase {}", timing.top, timing.phase);
        Ok(())
    }

    /// Sets all four dead times. In up/down counting mode only the rising
    /// edge values are used, applied symmetrically.
    pub fn set_dead_times(&mut self, dead_times: DeadTimes) -> Result<(), PsPwmError> {
        let dead_times = self.normalize(dead_times);
        self.check_dead_times(&dead_times, self.limits.dt_sum_max)?;
        let timing = self.compute_timing(self.setpoint.frequency, self.setpoint.ps_duty, &dead_times);
        self.write_timing(&timing);
        self.store_dead_times(&dead_times);
        log_debug!(
            "ps_pwm: dead bands lead {}/{} lag {}/{}",
            timing.lead_red,
            timing.lead_fed,
            timing.lag_red,
            timing.lag_fed
        );
        Ok(())
    }

    pub fn set_dead_times_symmetrical(&mut self, lead: f32, lag: f32) -> Result<(), PsPwmError> {
        self.set_dead_times(DeadTimes::symmetric(lead, lag))
    }

    /// Sets the phase shift of timer 1 relative to timer 0 as a fraction of
    /// the maximum phase shift.
    pub fn set_ps_duty(&mut self, ps_duty: f32) -> Result<(), PsPwmError> {
        check_duty(ps_duty)?;
        critical_section::with(|_| {
            let top = self.regs.period(Timer::T0);
            let phase = phase_value(self.mode, top, ps_duty);
            self.regs.set_phase(Timer::T1, phase);
        });
        self.setpoint.ps_duty = ps_duty;
        Ok(())
    }

    /// Trips both operators. Idempotent.
    pub fn disable_output(&mut self) {
        log_debug!("ps_pwm: disabling output");
        critical_section::with(|_| {
            self.regs.force_one_shot(Timer::T0);
            self.regs.force_one_shot(Timer::T1);
        });
        self.setpoint.output_enabled = false;
    }

    /// Re-aligns both timers to the phase setpoint, then clears the trip.
    /// Refused while a hardware fault is latched.
    pub fn resync_enable_output(&mut self) -> Result<(), PsPwmError> {
        if self.get_fault_latched() {
            log_warn!("ps_pwm: not enabling output, hardware fault latched");
            return Err(PsPwmError::FaultLatched);
        }
        log_debug!("ps_pwm: enabling output");
        critical_section::with(|_| {
            self.regs.sync_software(Timer::T0);
            self.regs.sync_software(Timer::T1);
            self.regs.clear_one_shot(Timer::T0);
            self.regs.clear_one_shot(Timer::T1);
        });
        self.setpoint.output_enabled = true;
        Ok(())
    }

    pub fn enable_hw_fault_shutdown(&mut self, polarity: FaultPolarity) {
        log_debug!("ps_pwm: enabling hardware fault shutdown, {:?}", polarity);
        critical_section::with(|_| self.regs.enable_hw_fault(polarity));
    }

    pub fn disable_hw_fault_shutdown(&mut self) {
        critical_section::with(|_| self.regs.disable_hw_fault());
    }

    /// Instantaneous state of the hardware fault input.
    pub fn get_fault_present(&self) -> bool {
        self.regs.hw_fault_present()
    }

    /// Latched fault flag. A latched fault has tripped the outputs, so the
    /// output-enabled flag is dropped when one is observed.
    pub fn get_fault_latched(&mut self) -> bool {
        if !self.fault_latched && self.regs.hw_fault_event() {
            log_warn!("ps_pwm: hardware fault shutdown latched");
            self.fault_latched = true;
        }
        if self.fault_latched {
            self.setpoint.output_enabled = false;
        }
        self.fault_latched
    }

    /// Clears the latched fault flag. Outputs stay tripped.
    pub fn clear_fault_latched(&mut self) {
        critical_section::with(|_| self.regs.clear_hw_fault_event());
        self.fault_latched = false;
    }

    fn dead_times(&self) -> DeadTimes {
        DeadTimes {
            lead_red: self.setpoint.lead_red,
            lead_fed: self.setpoint.lead_fed,
            lag_red: self.setpoint.lag_red,
            lag_fed: self.setpoint.lag_fed,
        }
    }

    fn store_dead_times(&mut self, dt: &DeadTimes) {
        self.setpoint.lead_red = dt.lead_red;
        self.setpoint.lead_fed = dt.lead_fed;
        self.setpoint.lag_red = dt.lag_red;
        self.setpoint.lag_fed = dt.lag_fed;
    }

    fn normalize(&self, dt: DeadTimes) -> DeadTimes {
        match self.mode {
            PwmMode::UpCounting => dt,
            PwmMode::UpDownCounting => DeadTimes::symmetric(dt.lead_red, dt.lag_red),
        }
    }

    fn check_frequency(&self, frequency: f32) -> Result<(), PsPwmError> {
        if !frequency.is_finite()
            || frequency <= self.limits.frequency_min
            || frequency > self.limits.frequency_max
        {
            log_error!("ps_pwm: frequency setpoint out of range: {}", frequency);
            return Err(PsPwmError::FrequencyOutOfRange);
        }
        Ok(())
    }

    fn check_dead_times(&self, dt: &DeadTimes, dt_sum_max: f32) -> Result<(), PsPwmError> {
        let values = [dt.lead_red, dt.lead_fed, dt.lag_red, dt.lag_fed];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0)
            || dt.lead_red + dt.lead_fed >= dt_sum_max
            || dt.lag_red + dt.lag_fed >= dt_sum_max
        {
            log_error!("ps_pwm: dead time setpoint out of range");
            return Err(PsPwmError::DeadTimeOutOfRange);
        }
        Ok(())
    }

    fn compute_timing(&self, frequency: f32, ps_duty: f32, dt: &DeadTimes) -> TimingRegs {
        let timer_clk = self.clk_conf.timer_clk;
        let base_clk = self.clk_conf.base_clk;
        match self.mode {
            PwmMode::UpCounting => {
                let top = counts(timer_clk / frequency - 1.0, REG_MAX);
                // Compare values keep the pulse centered with unequal edge delays
                let lead_cmp_a = counts(
                    0.5 * (top as f32 + timer_clk * (dt.lead_red - dt.lead_fed)),
                    top as u32,
                );
                let lag_cmp_a = counts(
                    0.5 * (top as f32 + timer_clk * (dt.lag_red - dt.lag_fed)),
                    top as u32,
                );
                TimingRegs {
                    top,
                    phase: phase_value(self.mode, top, ps_duty),
                    lead_cmp_a,
                    lead_cmp_b: 0,
                    lag_cmp_a,
                    lag_cmp_b: 0,
                    lead_red: counts(dt.lead_red * base_clk, REG_MAX),
                    lead_fed: counts(dt.lead_fed * base_clk, REG_MAX),
                    lag_red: counts(dt.lag_red * base_clk, REG_MAX),
                    lag_fed: counts(dt.lag_fed * base_clk, REG_MAX),
                }
            }
            PwmMode::UpDownCounting => {
                let top = counts(0.5 * timer_clk / frequency, REG_MAX);
                let lead_cmp_a = counts(0.5 * timer_clk * dt.lead_red, top as u32);
                let lag_cmp_a = counts(0.5 * timer_clk * dt.lag_red, top as u32);
                TimingRegs {
                    top,
                    phase: phase_value(self.mode, top, ps_duty),
                    lead_cmp_a,
                    lead_cmp_b: top - lead_cmp_a,
                    lag_cmp_a,
                    lag_cmp_b: top - lag_cmp_a,
                    lead_red: 0,
                    lead_fed: 0,
                    lag_red: 0,
                    lag_fed: 0,
                }
            }
        }
    }

    fn write_timing(&mut self, t: &TimingRegs) {
        let mode = self.mode;
        critical_section::with(|_| {
            let regs = &mut self.regs;
            regs.set_period(Timer::T0, t.top);
            regs.set_period(Timer::T1, t.top);
            regs.set_compare(Timer::T0, Compare::A, t.lead_cmp_a);
            regs.set_compare(Timer::T1, Compare::A, t.lag_cmp_a);
            match mode {
                PwmMode::UpCounting => {
                    regs.set_dead_band(Timer::T0, t.lead_red, t.lead_fed);
                    regs.set_dead_band(Timer::T1, t.lag_red, t.lag_fed);
                }
                PwmMode::UpDownCounting => {
                    regs.set_compare(Timer::T0, Compare::B, t.lead_cmp_b);
                    regs.set_compare(Timer::T1, Compare::B, t.lag_cmp_b);
                }
            }
            // Timer 0 is the reference and has no phase offset
            regs.set_phase(Timer::T1, t.phase);
        });
    }

    #[cfg(test)]
    pub(crate) fn registers(&self) -> &R {
        &self.regs
    }

    #[cfg(test)]
    pub(crate) fn registers_mut(&mut self) -> &mut R {
        &mut self.regs
    }
}

/// Frequency limits `(min, max)` for the given mode; `min` is exclusive.
pub fn frequency_limits(mode: PwmMode, clk: &ClkConf) -> (f32, f32) {
    match mode {
        PwmMode::UpCounting => (
            clk.timer_clk / REG_MAX as f32,
            clk.timer_clk / (1 + TIMER_TOP_MIN) as f32,
        ),
        PwmMode::UpDownCounting => (
            0.5 * clk.timer_clk / REG_MAX as f32,
            0.5 * clk.timer_clk / TIMER_TOP_MIN as f32,
        ),
    }
}

/// Maximum sum of rising and falling edge dead time for one leg.
pub fn dt_sum_max(clk: &ClkConf, frequency: f32) -> f32 {
    let register_limit = REG_MAX as f32 / clk.base_clk;
    let period = 1.0 / frequency;
    if register_limit < period {
        register_limit
    } else {
        period
    }
}

fn check_duty(ps_duty: f32) -> Result<(), PsPwmError> {
    if !(0.0..=1.0).contains(&ps_duty) {
        log_error!("ps_pwm: invalid setpoint value for ps_duty: {}", ps_duty);
        return Err(PsPwmError::DutyOutOfRange);
    }
    Ok(())
}

fn phase_value(mode: PwmMode, top: u16, ps_duty: f32) -> u16 {
    let phase = match mode {
        PwmMode::UpCounting => top as f32 * ps_duty / 2.0,
        PwmMode::UpDownCounting => top as f32 * ps_duty,
    };
    counts(phase, top as u32)
}

/// Rounds a count to the nearest integer and clamps it into `[0, max]`.
fn counts(value: f32, max: u32) -> u16 {
    let value = FloatCore::round(value);
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= max as f32 {
        max as u16
    } else {
        value as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPwmRegisters, RegOp};

    fn config(mode: PwmMode) -> PsPwmConfig {
        PsPwmConfig {
            mode,
            clk_conf: ClkConf::new(160_000_000, 4, 4),
            frequency: 100e3,
            ps_duty: 0.5,
            dead_times: DeadTimes::symmetric(125e-9, 125e-9),
            output_enabled: false,
            disable_action_lead_leg: DisableAction::ForceLow,
            disable_action_lag_leg: DisableAction::ForceLow,
            fault_polarity: Some(FaultPolarity::ActiveLow),
        }
    }

    fn up_pwm() -> PsPwm<MockPwmRegisters> {
        PsPwm::new(MockPwmRegisters::default(), &config(PwmMode::UpCounting)).unwrap()
    }

    #[test]
    fn clock_configuration() {
        let clk = ClkConf::new(160_000_000, 4, 4);
        assert_eq!(clk.base_clk, 40e6);
        assert_eq!(clk.timer_clk, 10e6);
    }

    #[test]
    fn init_programs_up_counting_registers() {
        let pwm = up_pwm();
        let regs = pwm.registers();
        // 10 MHz / 100 kHz - 1
        assert_eq!(regs.period[0], 99);
        assert_eq!(regs.period[1], 99);
        // Symmetric dead time: compare in the middle of the period
        assert_eq!(regs.compare[0][0], 50);
        assert_eq!(regs.compare[1][0], 50);
        // 125 ns at 40 MHz
        assert_eq!(regs.dead_band[0], (5, 5));
        assert_eq!(regs.dead_band[1], (5, 5));
        assert_eq!(regs.phase[1], 25);
        assert_eq!(regs.phase[0], 0);
        assert!(regs.tripped[0] && regs.tripped[1]);
        assert_eq!(regs.hw_fault_enabled, Some(FaultPolarity::ActiveLow));
        assert!(!pwm.setpoint().output_enabled);
    }

    #[test]
    fn init_rejects_invalid_setpoints() {
        let mut cfg = config(PwmMode::UpCounting);
        cfg.frequency = 10e6;
        assert_eq!(
            PsPwm::new(MockPwmRegisters::default(), &cfg).err(),
            Some(PsPwmError::FrequencyOutOfRange)
        );
        let mut cfg = config(PwmMode::UpCounting);
        cfg.ps_duty = 1.5;
        assert_eq!(
            PsPwm::new(MockPwmRegisters::default(), &cfg).err(),
            Some(PsPwmError::DutyOutOfRange)
        );
        let mut cfg = config(PwmMode::UpCounting);
        cfg.dead_times.lag_fed = -1e-9;
        assert_eq!(
            PsPwm::new(MockPwmRegisters::default(), &cfg).err(),
            Some(PsPwmError::DeadTimeOutOfRange)
        );
    }

    #[test]
    fn limits_follow_mode() {
        let pwm = up_pwm();
        let limits = pwm.setpoint_limits();
        assert!((limits.frequency_max - 10e6 / 3.0).abs() < 1.0);
        assert!((limits.dt_sum_max - 10e-6).abs() < 1e-9);

        let pwm = PsPwm::new(MockPwmRegisters::default(), &config(PwmMode::UpDownCounting)).unwrap();
        let limits = pwm.setpoint_limits();
        assert!((limits.frequency_max - 2.5e6).abs() < 1.0);
        assert!((limits.frequency_min - 0.5 * 10e6 / 65535.0).abs() < 1e-3);
    }

    #[test]
    fn frequency_range_is_enforced() {
        let mut pwm = up_pwm();
        assert_eq!(pwm.set_frequency(0.0), Err(PsPwmError::FrequencyOutOfRange));
        assert_eq!(pwm.set_frequency(-5.0), Err(PsPwmError::FrequencyOutOfRange));
        assert_eq!(pwm.set_frequency(f32::NAN), Err(PsPwmError::FrequencyOutOfRange));
        // TOP would exceed 16 bits
        assert_eq!(pwm.set_frequency(100.0), Err(PsPwmError::FrequencyOutOfRange));
        assert_eq!(pwm.setpoint().frequency, 100e3);
        assert_eq!(pwm.registers().period[0], 99);

        pwm.set_frequency(50e3).unwrap();
        assert_eq!(pwm.registers().period[0], 199);
        assert_eq!(pwm.registers().phase[1], 50);
        assert!((pwm.setpoint_limits().dt_sum_max - 20e-6).abs() < 1e-9);
    }

    #[test]
    fn asymmetric_dead_time_shifts_compare() {
        let mut pwm = up_pwm();
        pwm.set_dead_times(DeadTimes {
            lead_red: 600e-9,
            lead_fed: 100e-9,
            lag_red: 100e-9,
            lag_fed: 600e-9,
        })
        .unwrap();
        let regs = pwm.registers();
        // 0.5 * (99 + 10e6 * 500e-9)
        assert_eq!(regs.compare[0][0], 52);
        // 0.5 * (99 - 5)
        assert_eq!(regs.compare[1][0], 47);
        assert_eq!(regs.dead_band[0], (24, 4));
        assert_eq!(regs.dead_band[1], (4, 24));
        assert_eq!(pwm.setpoint().lead_red, 600e-9);
    }

    #[test]
    fn dead_time_sum_exceeding_period_is_rejected() {
        let mut pwm = up_pwm();
        // Period register 200 counts
        pwm.set_frequency(50e3).unwrap();
        assert_eq!(pwm.registers().period[0], 199);
        let before = *pwm.setpoint();
        let writes = pwm.registers().ops.len();
        let tick = 1.0 / 10e6;
        let result = pwm.set_dead_times(DeadTimes {
            lead_red: 150.0 * tick,
            lead_fed: 100.0 * tick,
            lag_red: 125e-9,
            lag_fed: 125e-9,
        });
        assert_eq!(result, Err(PsPwmError::DeadTimeOutOfRange));
        assert_eq!(*pwm.setpoint(), before);
        assert_eq!(pwm.registers().ops.len(), writes);
    }

    #[test]
    fn frequency_rejected_when_dead_times_no_longer_fit() {
        let mut pwm = up_pwm();
        pwm.set_dead_times(DeadTimes::symmetric(2e-6, 2e-6)).unwrap();
        // 4 us dead time sum does not fit into a 3.3 us period
        assert_eq!(pwm.set_frequency(300e3), Err(PsPwmError::DeadTimeOutOfRange));
        assert_eq!(pwm.setpoint().frequency, 100e3);
    }

    #[test]
    fn up_down_mode_uses_compare_dead_times() {
        let mut cfg = config(PwmMode::UpDownCounting);
        cfg.dead_times = DeadTimes {
            lead_red: 200e-9,
            lead_fed: 999e-9,
            lag_red: 400e-9,
            lag_fed: 0.0,
        };
        let pwm = PsPwm::new(MockPwmRegisters::default(), &cfg).unwrap();
        let regs = pwm.registers();
        // 0.5 * 10 MHz / 100 kHz
        assert_eq!(regs.period[0], 50);
        assert_eq!(regs.compare[0], [1, 49]);
        assert_eq!(regs.compare[1], [2, 48]);
        assert_eq!(regs.phase[1], 25);
        // Falling edge values are forced symmetric
        assert_eq!(pwm.setpoint().lead_fed, 200e-9);
        assert_eq!(pwm.setpoint().lag_fed, 400e-9);
    }

    #[test]
    fn phase_shift_follows_period() {
        let mut pwm = up_pwm();
        pwm.set_ps_duty(1.0).unwrap();
        assert_eq!(pwm.registers().phase[1], 50);
        pwm.set_ps_duty(0.0).unwrap();
        assert_eq!(pwm.registers().phase[1], 0);
        assert_eq!(pwm.set_ps_duty(-0.1), Err(PsPwmError::DutyOutOfRange));
        assert_eq!(pwm.set_ps_duty(1.01), Err(PsPwmError::DutyOutOfRange));
        assert_eq!(pwm.setpoint().ps_duty, 0.0);
    }

    #[test]
    fn enable_syncs_before_clearing_trip() {
        let mut pwm = up_pwm();
        pwm.registers_mut().ops.clear();
        pwm.resync_enable_output().unwrap();
        assert_eq!(
            pwm.registers().ops.as_slice(),
            &[
                RegOp::Sync(Timer::T0),
                RegOp::Sync(Timer::T1),
                RegOp::ClearOneShot(Timer::T0),
                RegOp::ClearOneShot(Timer::T1),
            ]
        );
        assert!(pwm.setpoint().output_enabled);
        assert!(!pwm.registers().tripped[0]);
    }

    #[test]
    fn disable_output_is_idempotent() {
        let mut pwm = up_pwm();
        pwm.resync_enable_output().unwrap();
        pwm.disable_output();
        let once = (pwm.registers().tripped, *pwm.setpoint());
        pwm.disable_output();
        assert_eq!((pwm.registers().tripped, *pwm.setpoint()), once);
        assert!(!pwm.setpoint().output_enabled);
    }

    #[test]
    fn latched_fault_blocks_enable_until_cleared() {
        let mut pwm = up_pwm();
        pwm.resync_enable_output().unwrap();
        pwm.registers_mut().trip_by_hw_fault();
        assert!(pwm.get_fault_present());
        assert!(pwm.get_fault_latched());
        assert!(!pwm.setpoint().output_enabled);
        assert_eq!(pwm.resync_enable_output(), Err(PsPwmError::FaultLatched));

        // Fault input released, latch still set
        pwm.registers_mut().fault_input = false;
        assert!(!pwm.get_fault_present());
        assert!(pwm.get_fault_latched());

        pwm.clear_fault_latched();
        assert!(!pwm.get_fault_latched());
        // Clearing the latch does not re-enable the output
        assert!(pwm.registers().tripped[0]);
        pwm.resync_enable_output().unwrap();
        assert!(pwm.setpoint().output_enabled);
    }
}
