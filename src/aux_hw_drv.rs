//! Auxiliary power stage hardware: relays, fan, gate driver supply and
//! disable lines, the current limit reference PWM, the overcurrent latch
//! reset line and the two heat sink temperature sensors.

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::PwmPin;
use num_traits::float::FloatCore;

use crate::adc_channel::{RawSampler, SensorError};
use crate::app_config::AuxHwConfig;
use crate::sensor_kty81::Kty81Sensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxHwError {
    /// A discrete output could not be driven
    PinWrite,
    /// Current limit negative, not finite or above full scale
    CurrentLimitOutOfRange,
    /// Temperature limit is NaN or infinite
    TempLimitNotFinite,
    Sensor(SensorError),
}

#[cfg(feature = "defmt")]
impl defmt::Format for AuxHwError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            AuxHwError::PinWrite => defmt::write!(f, "AuxHwError::PinWrite"),
            AuxHwError::CurrentLimitOutOfRange => {
                defmt::write!(f, "AuxHwError::CurrentLimitOutOfRange")
            }
            AuxHwError::TempLimitNotFinite => defmt::write!(f, "AuxHwError::TempLimitNotFinite"),
            AuxHwError::Sensor(e) => defmt::write!(f, "AuxHwError::Sensor({:?})", e),
        }
    }
}

impl From<SensorError> for AuxHwError {
    fn from(e: SensorError) -> Self {
        AuxHwError::Sensor(e)
    }
}

/// Discrete outputs, all active high.
pub struct AuxPins<P: OutputPin> {
    pub relay_ref: P,
    pub relay_dut: P,
    pub fan: P,
    pub drv_supply: P,
    pub drv_disable: P,
    pub oc_reset: P,
}

/// Setpoints and readings of the auxiliary hardware.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AuxHwState {
    pub current_limit: f32,
    pub relay_ref_active: bool,
    pub relay_dut_active: bool,
    pub fan_active: bool,
    pub fan_override: bool,
    pub drv_supply_active: bool,
    pub drv_disabled: bool,
    pub temp_1: f32,
    pub temp_2: f32,
    pub temp_1_limit: f32,
    pub temp_2_limit: f32,
    /// Latched until explicitly cleared
    pub hw_overtemp: bool,
}

impl Default for AuxHwState {
    /// Starts out in the safe state: temperatures read as high, overtemp set.
    fn default() -> Self {
        Self {
            current_limit: 8.0,
            relay_ref_active: false,
            relay_dut_active: false,
            fan_active: true,
            fan_override: false,
            drv_supply_active: true,
            drv_disabled: false,
            temp_1: 150.0,
            temp_2: 150.0,
            temp_1_limit: 50.0,
            temp_2_limit: 50.0,
            hw_overtemp: true,
        }
    }
}

fn write_pin<P: OutputPin>(pin: &mut P, high: bool) -> Result<(), AuxHwError> {
    let result = if high { pin.set_high() } else { pin.set_low() };
    result.map_err(|_| {
        log_error!("AUX: pin write failed");
        AuxHwError::PinWrite
    })
}

pub struct AuxHwDrv<P, C, A>
where
    P: OutputPin,
    C: PwmPin<Duty = u16>,
    A: RawSampler,
{
    pins: AuxPins<P>,
    curr_limit_pwm: C,
    sensor_temp_1: Kty81Sensor<A>,
    sensor_temp_2: Kty81Sensor<A>,
    config: AuxHwConfig,
    state: AuxHwState,
}

impl<P, C, A> AuxHwDrv<P, C, A>
where
    P: OutputPin,
    C: PwmPin<Duty = u16>,
    A: RawSampler,
{
    /// Drives all outputs to the levels in `state`.
    pub fn new(
        pins: AuxPins<P>,
        mut curr_limit_pwm: C,
        sensor_temp_1: Kty81Sensor<A>,
        sensor_temp_2: Kty81Sensor<A>,
        config: AuxHwConfig,
        state: AuxHwState,
    ) -> Result<Self, AuxHwError> {
        log_debug!("AUX: configuring auxiliary hardware");
        curr_limit_pwm.enable();
        let mut drv = Self {
            pins,
            curr_limit_pwm,
            sensor_temp_1,
            sensor_temp_2,
            config,
            state,
        };
        drv.set_current_limit(state.current_limit)?;
        drv.set_relay_ref_active(state.relay_ref_active)?;
        drv.set_relay_dut_active(state.relay_dut_active)?;
        drv.set_fan_active(state.fan_active)?;
        drv.set_drv_supply_active(state.drv_supply_active)?;
        drv.set_drv_disabled(state.drv_disabled)?;
        drv.oc_reset_finish()?;
        Ok(drv)
    }

    pub fn state(&self) -> &AuxHwState {
        &self.state
    }

    pub fn config(&self) -> &AuxHwConfig {
        &self.config
    }

    /// Sets the analog current limit reference in A.
    pub fn set_current_limit(&mut self, value: f32) -> Result<(), AuxHwError> {
        if !value.is_finite() || value < 0.0 || value > self.config.curr_limit_full_scale {
            log_error!("AUX: current limit out of range: {}", value);
            return Err(AuxHwError::CurrentLimitOutOfRange);
        }
        let max_duty = self.curr_limit_pwm.get_max_duty();
        let duty = self.config.curr_limit_pwm_offset as f32
            + value / self.config.curr_limit_full_scale * max_duty as f32;
        let duty = if duty >= max_duty as f32 {
            max_duty
        } else {
            FloatCore::round(duty) as u16
        };
        log_debug!("AUX: current limit {} A, reference duty {}", value, duty);
        self.curr_limit_pwm.set_duty(duty);
        self.state.current_limit = value;
        Ok(())
    }

    pub fn set_relay_ref_active(&mut self, state: bool) -> Result<(), AuxHwError> {
        log_debug!("AUX: relay REF active: {}", state);
        write_pin(&mut self.pins.relay_ref, state)?;
        self.state.relay_ref_active = state;
        Ok(())
    }

    pub fn set_relay_dut_active(&mut self, state: bool) -> Result<(), AuxHwError> {
        log_debug!("AUX: relay DUT active: {}", state);
        write_pin(&mut self.pins.relay_dut, state)?;
        self.state.relay_dut_active = state;
        Ok(())
    }

    pub fn set_fan_active(&mut self, state: bool) -> Result<(), AuxHwError> {
        if state != self.state.fan_active {
            log_debug!("AUX: fan active: {}", state);
        }
        write_pin(&mut self.pins.fan, state)?;
        self.state.fan_active = state;
        Ok(())
    }

    /// Forces the fan on regardless of temperature. Releasing the override
    /// leaves the fan to the next evaluation.
    pub fn set_fan_override(&mut self, state: bool) -> Result<(), AuxHwError> {
        self.state.fan_override = state;
        if state {
            self.set_fan_active(true)?;
        }
        Ok(())
    }

    pub fn set_drv_supply_active(&mut self, state: bool) -> Result<(), AuxHwError> {
        log_debug!("AUX: gate driver supply active: {}", state);
        write_pin(&mut self.pins.drv_supply, state)?;
        self.state.drv_supply_active = state;
        Ok(())
    }

    pub fn set_drv_disabled(&mut self, state: bool) -> Result<(), AuxHwError> {
        log_debug!("AUX: gate driver disabled: {}", state);
        write_pin(&mut self.pins.drv_disable, state)?;
        self.state.drv_disabled = state;
        Ok(())
    }

    /// Overtemperature threshold of sensor 1 in °C. A non-finite limit
    /// would never trip and is refused.
    pub fn set_temp_1_limit(&mut self, value: f32) -> Result<(), AuxHwError> {
        if !value.is_finite() {
            return Err(AuxHwError::TempLimitNotFinite);
        }
        self.state.temp_1_limit = value;
        Ok(())
    }

    pub fn set_temp_2_limit(&mut self, value: f32) -> Result<(), AuxHwError> {
        if !value.is_finite() {
            return Err(AuxHwError::TempLimitNotFinite);
        }
        self.state.temp_2_limit = value;
        Ok(())
    }

    /// Start of the overcurrent latch reset pulse.
    pub fn oc_reset_start(&mut self) -> Result<(), AuxHwError> {
        write_pin(&mut self.pins.oc_reset, true)
    }

    /// End of the overcurrent latch reset pulse.
    pub fn oc_reset_finish(&mut self) -> Result<(), AuxHwError> {
        write_pin(&mut self.pins.oc_reset, false)
    }

    /// Samples both sensors and stores the filtered temperatures.
    pub fn update_temperatures(&mut self) -> Result<(), AuxHwError> {
        self.sensor_temp_1.tick()?;
        self.sensor_temp_2.tick()?;
        self.state.temp_1 = self.sensor_temp_1.value_pwl();
        self.state.temp_2 = self.sensor_temp_2.value_pwl();
        Ok(())
    }

    /// Latches overtemperature and runs the fan hysteresis.
    pub fn evaluate_temperatures(&mut self) -> Result<(), AuxHwError> {
        let s = self.state;
        let c = self.config;
        if s.temp_1 > s.temp_1_limit || s.temp_2 > s.temp_2_limit {
            if !s.hw_overtemp {
                log_warn!(
                    "AUX: overtemperature, temp_1 {} temp_2 {}",
                    s.temp_1,
                    s.temp_2
                );
            }
            self.state.hw_overtemp = true;
        }
        if s.fan_override
            || s.temp_1 >= c.temp_1_fan_threshold_hi
            || s.temp_2 >= c.temp_2_fan_threshold_hi
        {
            self.set_fan_active(true)?;
        } else if s.temp_1 < c.temp_1_fan_threshold_lo && s.temp_2 < c.temp_2_fan_threshold_lo {
            self.set_fan_active(false)?;
        }
        Ok(())
    }

    /// Clears the firmware overtemperature latch. Call
    /// [`Self::evaluate_temperatures`] afterwards.
    pub fn clear_overtemp(&mut self) {
        self.state.hw_overtemp = false;
    }

    #[cfg(test)]
    pub(crate) fn pins(&self) -> &AuxPins<P> {
        &self.pins
    }

    #[cfg(test)]
    pub(crate) fn curr_limit_pwm(&self) -> &C {
        &self.curr_limit_pwm
    }

    #[cfg(test)]
    pub(crate) fn sensor_samplers_mut(&mut self) -> (&mut A, &mut A) {
        (
            self.sensor_temp_1.sampler_mut(),
            self.sensor_temp_2.sampler_mut(),
        )
    }

    #[cfg(test)]
    pub(crate) fn set_temperatures(&mut self, temp_1: f32, temp_2: f32) {
        self.state.temp_1 = temp_1;
        self.state.temp_2 = temp_2;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adc_channel::{AdcCalibration, DEFAULT_VREF_MV};
    use crate::mock::{MockAdc, MockPin, MockPwmPin, MOCK_PWM_MAX_DUTY};
    use crate::sensor_kty81::Kty81Variant;

    pub(crate) type MockAuxHwDrv = AuxHwDrv<MockPin, MockPwmPin, MockAdc>;

    /// Raw ADC value for a sensor voltage in mV.
    pub(crate) fn raw_at_mv(mv: i32) -> u16 {
        let cal = AdcCalibration::characterize(None, None, DEFAULT_VREF_MV);
        cal.raw_from_voltage(mv) as u16
    }

    pub(crate) fn mock_aux_hw_drv(sensor_mv: i32) -> MockAuxHwDrv {
        let cal = AdcCalibration::characterize(None, None, DEFAULT_VREF_MV);
        let raw = raw_at_mv(sensor_mv);
        let s1 = Kty81Sensor::new(MockAdc::new(raw), cal, Kty81Variant::Kty81_121).unwrap();
        let s2 = Kty81Sensor::new(MockAdc::new(raw), cal, Kty81Variant::Kty81_121).unwrap();
        let pins = AuxPins {
            relay_ref: MockPin::default(),
            relay_dut: MockPin::default(),
            fan: MockPin::default(),
            drv_supply: MockPin::default(),
            drv_disable: MockPin::default(),
            oc_reset: MockPin::default(),
        };
        AuxHwDrv::new(
            pins,
            MockPwmPin::default(),
            s1,
            s2,
            AuxHwConfig::default(),
            AuxHwState::default(),
        )
        .unwrap()
    }

    #[test]
    fn outputs_start_at_defaults() {
        let drv = mock_aux_hw_drv(886);
        let pins = drv.pins();
        assert!(pins.fan.high);
        assert!(pins.drv_supply.high);
        assert!(!pins.drv_disable.high);
        assert!(!pins.relay_ref.high);
        assert!(!pins.oc_reset.high);
        assert!(drv.curr_limit_pwm().enabled);
        // 8 A of 100 A full scale
        assert_eq!(drv.curr_limit_pwm().duty, MOCK_PWM_MAX_DUTY * 8 / 100);
        assert!(drv.state().hw_overtemp);
    }

    #[test]
    fn current_limit_range() {
        let mut drv = mock_aux_hw_drv(886);
        drv.set_current_limit(50.0).unwrap();
        assert_eq!(drv.curr_limit_pwm().duty, 500);
        drv.set_current_limit(100.0).unwrap();
        assert_eq!(drv.curr_limit_pwm().duty, MOCK_PWM_MAX_DUTY);
        assert_eq!(
            drv.set_current_limit(-1.0),
            Err(AuxHwError::CurrentLimitOutOfRange)
        );
        assert_eq!(
            drv.set_current_limit(f32::NAN),
            Err(AuxHwError::CurrentLimitOutOfRange)
        );
        assert_eq!(drv.state().current_limit, 100.0);
    }

    #[test]
    fn overtemp_latches() {
        let mut drv = mock_aux_hw_drv(886);
        drv.clear_overtemp();
        drv.set_temperatures(60.0, 20.0);
        drv.evaluate_temperatures().unwrap();
        assert!(drv.state().hw_overtemp);
        // Stays latched after cooling down
        drv.set_temperatures(20.0, 20.0);
        drv.evaluate_temperatures().unwrap();
        assert!(drv.state().hw_overtemp);
        drv.clear_overtemp();
        drv.evaluate_temperatures().unwrap();
        assert!(!drv.state().hw_overtemp);
    }

    #[test]
    fn temp_limits_must_be_finite() {
        let mut drv = mock_aux_hw_drv(886);
        drv.set_temp_1_limit(70.0).unwrap();
        assert_eq!(
            drv.set_temp_1_limit(f32::INFINITY),
            Err(AuxHwError::TempLimitNotFinite)
        );
        assert_eq!(
            drv.set_temp_2_limit(f32::NAN),
            Err(AuxHwError::TempLimitNotFinite)
        );
        assert_eq!(drv.state().temp_1_limit, 70.0);
        assert_eq!(drv.state().temp_2_limit, 50.0);
        // The kept limits still trip
        drv.clear_overtemp();
        drv.set_temperatures(20.0, 55.0);
        drv.evaluate_temperatures().unwrap();
        assert!(drv.state().hw_overtemp);
    }

    #[test]
    fn fan_hysteresis() {
        let mut drv = mock_aux_hw_drv(886);
        drv.set_temperatures(30.0, 30.0);
        drv.evaluate_temperatures().unwrap();
        assert!(!drv.state().fan_active);
        // Between thresholds: unchanged
        drv.set_temperatures(42.0, 30.0);
        drv.evaluate_temperatures().unwrap();
        assert!(!drv.state().fan_active);
        drv.set_temperatures(30.0, 45.0);
        drv.evaluate_temperatures().unwrap();
        assert!(drv.state().fan_active);
        drv.set_temperatures(42.0, 39.0);
        drv.evaluate_temperatures().unwrap();
        assert!(drv.state().fan_active);
        drv.set_temperatures(39.9, 39.0);
        drv.evaluate_temperatures().unwrap();
        assert!(!drv.state().fan_active);
        assert!(!drv.pins().fan.high);
    }

    #[test]
    fn fan_override_forces_fan_on() {
        let mut drv = mock_aux_hw_drv(886);
        drv.set_temperatures(20.0, 20.0);
        drv.evaluate_temperatures().unwrap();
        assert!(!drv.state().fan_active);
        drv.set_fan_override(true).unwrap();
        assert!(drv.pins().fan.high);
        drv.evaluate_temperatures().unwrap();
        assert!(drv.state().fan_active);
        drv.set_fan_override(false).unwrap();
        drv.evaluate_temperatures().unwrap();
        assert!(!drv.state().fan_active);
    }

    #[test]
    fn sensors_feed_temperatures() {
        let mut drv = mock_aux_hw_drv(886);
        drv.update_temperatures().unwrap();
        assert!(drv.state().temp_1.abs() < 1.5);
        assert!(drv.state().temp_2.abs() < 1.5);
    }

    #[test]
    fn oc_reset_pulse() {
        let mut drv = mock_aux_hw_drv(886);
        drv.oc_reset_start().unwrap();
        assert!(drv.pins().oc_reset.high);
        drv.oc_reset_finish().unwrap();
        assert_eq!(drv.pins().oc_reset.history, vec![false, true, false]);
    }
}
