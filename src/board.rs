//! Peripheral types of one board, bundled so the controller carries a
//! single type parameter.

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::PwmPin;

use crate::adc_channel::RawSampler;
use crate::api_server::PushSink;
use crate::aux_hw_drv::AuxHwDrv;
use crate::ps_pwm::PwmRegisters;
use crate::settings_store::BlobStore;

pub trait Board {
    /// Register block of the two phase-shifted timers
    type PwmRegs: PwmRegisters;
    /// Discrete auxiliary outputs
    type Pin: OutputPin;
    /// Current limit reference PWM channel
    type RefPwm: PwmPin<Duty = u16>;
    /// Temperature sensor ADC input
    type Adc: RawSampler;
    type Store: BlobStore;
    type Sink: PushSink;
}

pub type BoardAuxHwDrv<B> = AuxHwDrv<<B as Board>::Pin, <B as Board>::RefPwm, <B as Board>::Adc>;
