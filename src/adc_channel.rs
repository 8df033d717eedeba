//! Calibrated, oversampled and filtered ADC input channel.

use core::marker::PhantomData;

use crate::adc_filter::MovingAverage;

/// Full-scale raw value of the 12-bit converter
pub const ADC_RAW_MAX: u16 = 4095;
/// Reference voltage used when no factory calibration record is available
pub const DEFAULT_VREF_MV: u32 = 3300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// The converter did not deliver a sample
    AdcRead,
}

#[cfg(feature = "defmt")]
impl defmt::Format for SensorError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            SensorError::AdcRead => defmt::write!(f, "SensorError::AdcRead"),
        }
    }
}

/// Source of single raw conversions for one analog input.
pub trait RawSampler {
    type Error;

    fn sample(&mut self) -> Result<u16, Self::Error>;
}

/// Adapts a blocking `embedded-hal` one-shot ADC and its pin. `ID` is
/// the ADC type the pin belongs to.
pub struct OneShotSampler<ADC, PIN, ID> {
    adc: ADC,
    pin: PIN,
    _adc_id: PhantomData<ID>,
}

impl<ADC, PIN, ID> OneShotSampler<ADC, PIN, ID> {
    pub fn new(adc: ADC, pin: PIN) -> Self {
        Self {
            adc,
            pin,
            _adc_id: PhantomData,
        }
    }
}

impl<ADC, PIN, ID> RawSampler for OneShotSampler<ADC, PIN, ID>
where
    ADC: embedded_hal::adc::OneShot<ID, u16, PIN>,
    PIN: embedded_hal::adc::Channel<ID>,
{
    type Error = ADC::Error;

    fn sample(&mut self) -> Result<u16, Self::Error> {
        nb::block!(self.adc.read(&mut self.pin))
    }
}

/// Factory two-point calibration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwoPointCal {
    pub raw_low: u16,
    pub mv_low: u32,
    pub raw_high: u16,
    pub mv_high: u32,
}

/// Calibration source which was used to characterize a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationKind {
    TwoPoint,
    VrefFuse,
    DefaultVref,
}

/// Linear raw to millivolt characteristic:
/// `mv = (coeff_a * raw + 2^15) / 2^16 + coeff_b`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcCalibration {
    pub coeff_a: u32,
    pub coeff_b: i32,
    pub kind: CalibrationKind,
}

impl AdcCalibration {
    /// Characterizes from the best available record: two-point first, then
    /// the measured reference voltage, then `default_vref_mv`. A record
    /// without a rising characteristic is skipped.
    pub fn characterize(
        two_point: Option<TwoPointCal>,
        vref_mv: Option<u32>,
        default_vref_mv: u32,
    ) -> Self {
        let two_point =
            two_point.filter(|tp| tp.raw_high > tp.raw_low && tp.mv_high > tp.mv_low);
        if let Some(tp) = two_point {
            let d_raw = (tp.raw_high - tp.raw_low) as u32;
            let d_mv = tp.mv_high.saturating_sub(tp.mv_low);
            let coeff_a = ((d_mv << 16) + d_raw / 2) / d_raw;
            let coeff_b = tp.mv_low as i32 - Self::scale(coeff_a, tp.raw_low);
            log_info!("ADC: characterized using two-point calibration");
            return Self {
                coeff_a,
                coeff_b,
                kind: CalibrationKind::TwoPoint,
            };
        }
        let (vref, kind) = match vref_mv.filter(|vref| *vref > 0) {
            Some(vref) => {
                log_info!("ADC: characterized using reference voltage record");
                (vref, CalibrationKind::VrefFuse)
            }
            None => {
                log_info!("ADC: characterized using default reference voltage");
                (default_vref_mv, CalibrationKind::DefaultVref)
            }
        };
        Self {
            coeff_a: (vref << 16) / ADC_RAW_MAX as u32,
            coeff_b: 0,
            kind,
        }
    }

    fn scale(coeff_a: u32, raw: u16) -> i32 {
        ((coeff_a as u64 * raw as u64 + (1 << 15)) >> 16) as i32
    }

    pub fn voltage_mv(&self, raw: u16) -> i32 {
        Self::scale(self.coeff_a, raw) + self.coeff_b
    }

    /// Raw value which corresponds to `mv`, inverse of [`Self::voltage_mv`].
    pub fn raw_from_voltage(&self, mv: i32) -> i32 {
        let num = ((mv - self.coeff_b) as i64) * 65536 - 32768;
        (num / self.coeff_a as i64) as i32
    }
}

/// ADC channel summing `2^SHIFT` conversions per sample, followed by a
/// moving average of `LEN` samples.
pub struct AdcChannel<A: RawSampler, const SHIFT: u32, const LEN: usize> {
    sampler: A,
    calibration: AdcCalibration,
    filter: MovingAverage<LEN>,
}

impl<A: RawSampler, const SHIFT: u32, const LEN: usize> AdcChannel<A, SHIFT, LEN> {
    const VALID_SHIFT: () = assert!(SHIFT <= 16);

    /// Takes one sample right away to pre-fill the moving average.
    pub fn new(mut sampler: A, calibration: AdcCalibration) -> Result<Self, SensorError> {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_SHIFT;
        let first = Self::oversample(&mut sampler)?;
        Ok(Self {
            sampler,
            calibration,
            filter: MovingAverage::new(first),
        })
    }

    fn oversample(sampler: &mut A) -> Result<u16, SensorError> {
        let mut sum: u32 = 0;
        for _ in 0..(1u32 << SHIFT) {
            sum += sampler.sample().map_err(|_| SensorError::AdcRead)? as u32;
        }
        Ok((sum >> SHIFT) as u16)
    }

    /// Oversampled raw reading, bypassing the moving average.
    pub fn read_raw(&mut self) -> Result<u16, SensorError> {
        Self::oversample(&mut self.sampler)
    }

    /// Samples and pushes into the moving average.
    pub fn update_filter(&mut self) -> Result<(), SensorError> {
        let sample = Self::oversample(&mut self.sampler)?;
        self.filter.push(sample);
        Ok(())
    }

    pub fn filtered_raw(&self) -> u16 {
        self.filter.value()
    }

    pub fn filtered_mv(&self) -> i32 {
        self.calibration.voltage_mv(self.filter.value())
    }

    pub fn calibration(&self) -> &AdcCalibration {
        &self.calibration
    }

    #[cfg(test)]
    pub(crate) fn sampler_mut(&mut self) -> &mut A {
        &mut self.sampler
    }
}
