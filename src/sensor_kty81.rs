//! KTY81-1xx silicon temperature sensor.
//!
//! Sensor between GND and the ADC input, biased with a 2.2 kOhm series
//! resistor from the 3.3 V supply. The divider is linear enough between
//! 0 and 100 °C for a two-point conversion. Over the full -55 to 150 °C
//! range a 32-point look-up table is interpolated.

use crate::adc_channel::{AdcCalibration, AdcChannel, RawSampler, SensorError};
use crate::adc_filter::EquidistantPwl;

/// Oversampling: 2^5 conversions per sample
pub const KTY81_SAMPLE_SHIFT: u32 = 5;
/// Moving average length
pub const KTY81_FILTER_LEN: usize = 32;

// Linear conversion full-scale range
const TEMP_FSR_LOWER_LIN: f32 = 0.0;
const TEMP_FSR_UPPER_LIN: f32 = 100.0;
const MV_FSR_LOWER_LIN: i32 = 886;
const MV_FSR_UPPER_LIN: i32 = 1428;

// Look-up table input range, -55 °C .. 150 °C
const MV_FSR_LOWER_LUT: i32 = 596;
const MV_FSR_UPPER_LUT: i32 = 1646;

/// Temperatures at 32 equidistant voltage steps, KTY81-121.
pub const LUT_KTY81_121: [f32; 32] = [
    -55.0, -48.22273805, -41.51141124, -34.84623091, -28.34434926, -22.05459193, -15.78849403,
    -9.53746745, -3.3772341, 2.7675195, 8.9372679, 15.0916243, 21.14820431, 27.2082161,
    33.34543424, 39.41134763, 45.57173941, 51.73398583, 57.85244115, 64.10680179, 70.45422093,
    76.763773, 83.14712256, 89.64071316, 96.17984636, 102.82297981, 109.58309561, 116.4296579,
    123.60532846, 131.27866698, 139.78106609, 150.0,
];

/// Temperatures at 32 equidistant voltage steps, KTY81-110 and KTY81-120.
pub const LUT_KTY81_110_120: [f32; 32] = [
    -55.0, -48.16279303, -41.39749472, -34.8911357, -28.54294667, -22.192432, -15.83544756,
    -9.56004681, -3.43833483, 2.66313257, 8.80135444, 14.90432723, 20.97767882, 27.03976174,
    33.13792626, 39.28966437, 45.38382931, 51.48407173, 57.67841773, 63.97159787, 70.30279723,
    76.61562129, 83.00362829, 89.50586837, 96.07234208, 102.68301035, 109.39886725,
    116.34253305, 123.5137051, 131.2558412, 139.76912438, 150.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Kty81Variant {
    Kty81_121,
    Kty81_110_120,
}

impl Kty81Variant {
    fn lut(self) -> [f32; 32] {
        match self {
            Kty81Variant::Kty81_121 => LUT_KTY81_121,
            Kty81Variant::Kty81_110_120 => LUT_KTY81_110_120,
        }
    }
}

pub struct Kty81Sensor<A: RawSampler> {
    adc_ch: AdcChannel<A, KTY81_SAMPLE_SHIFT, KTY81_FILTER_LEN>,
    pwl: EquidistantPwl<32>,
    raw_lin_lower: i32,
    lin_gain: f32,
}

impl<A: RawSampler> Kty81Sensor<A> {
    pub fn new(
        sampler: A,
        calibration: AdcCalibration,
        variant: Kty81Variant,
    ) -> Result<Self, SensorError> {
        // Input ranges in raw ADC units of this channel
        let raw_lut_lower = calibration.raw_from_voltage(MV_FSR_LOWER_LUT);
        let raw_lut_upper = calibration.raw_from_voltage(MV_FSR_UPPER_LUT);
        let raw_lin_lower = calibration.raw_from_voltage(MV_FSR_LOWER_LIN);
        let raw_lin_upper = calibration.raw_from_voltage(MV_FSR_UPPER_LIN);
        let lin_gain =
            (TEMP_FSR_UPPER_LIN - TEMP_FSR_LOWER_LIN) / (raw_lin_upper - raw_lin_lower) as f32;
        let adc_ch = AdcChannel::new(sampler, calibration)?;
        log_debug!(
            "KTY81: {:?} LUT raw range {}..{}",
            variant,
            raw_lut_lower,
            raw_lut_upper
        );
        Ok(Self {
            adc_ch,
            pwl: EquidistantPwl::new(variant.lut(), raw_lut_lower, raw_lut_upper),
            raw_lin_lower,
            lin_gain,
        })
    }

    /// Samples the ADC into the moving average. Call periodically.
    pub fn tick(&mut self) -> Result<(), SensorError> {
        self.adc_ch.update_filter()
    }

    /// Temperature in °C by look-up table interpolation, valid over the
    /// whole -55 to 150 °C range.
    pub fn value_pwl(&self) -> f32 {
        self.pwl.interpolate(self.adc_ch.filtered_raw() as i32)
    }

    /// Temperature in °C by linear conversion, only accurate between 0 and
    /// 100 °C.
    pub fn value_linear(&self) -> f32 {
        let raw = self.adc_ch.filtered_raw() as i32;
        TEMP_FSR_LOWER_LIN + (raw - self.raw_lin_lower) as f32 * self.lin_gain
    }

    #[cfg(test)]
    pub(crate) fn sampler_mut(&mut self) -> &mut A {
        self.adc_ch.sampler_mut()
    }
}
