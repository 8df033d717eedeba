//! STM32G474 binding of the controller.
//!
//! TIM1 drives the leading leg on CH1/CH1N, TIM8 the lagging leg. TIM8 runs
//! in slave reset mode on TIM1 TRGO, which is taken from OC2REF of TIM1, so
//! TIM1 CCR2 is the phase shift. The hardware dead-band generator of both
//! timers provides rising and falling edge delays, the break input trips
//! the outputs.

use core::cell::RefCell;
use core::convert::Infallible;

use embassy_stm32::adc::{Adc, AnyAdcChannel};
use embassy_stm32::flash::{Blocking, Flash};
use embassy_stm32::gpio::Output;
use embassy_stm32::pac;
use embassy_stm32::pac::common::{Access, Reg};
use embassy_stm32::peripherals::{ADC1, TIM1, TIM4, TIM8};
use embassy_stm32::timer::complementary_pwm::ComplementaryPwm;
use embassy_stm32::timer::simple_pwm::SimplePwm;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::{ImmediatePublisher, PubSubChannel};
use heapless::String;

use crate::adc_channel::RawSampler;
use crate::api_server::PushSink;
use crate::app_state::JSON_BUF_LEN;
use crate::board::Board;
use crate::ps_pwm::{Compare, DisableAction, FaultPolarity, PwmMode, PwmRegisters, Timer};
use crate::settings_store::FlashBlobStore;

/// Queued events per subscriber before the oldest is dropped
pub const SSE_QUEUE_LEN: usize = 4;
/// Concurrent event stream clients
pub const SSE_MAX_CLIENTS: usize = 2;

/// One server-sent event.
#[derive(Debug, Clone)]
pub struct SseMessage {
    pub event: &'static str,
    pub data: String<JSON_BUF_LEN>,
}

pub type SseChannel =
    PubSubChannel<CriticalSectionRawMutex, SseMessage, SSE_QUEUE_LEN, SSE_MAX_CLIENTS, 1>;

// TIMx_CR1
const CR1_CEN: u32 = 1 << 0;
const CR1_CMS_CENTER1: u32 = 0b01 << 5;
const CR1_ARPE: u32 = 1 << 7;
const CR1_CKD_SHIFT: u32 = 8;
// TIMx_CR2, MMS = OC2REF
const CR2_MMS_OC2REF: u32 = 0b101 << 4;
// TIMx_SMCR, trigger ITR0 (TIM1 TRGO on TIM8) in reset mode
const SMCR_SMS_RESET: u32 = 0b100;
// TIMx_CCMR1
const CCMR1_OC1PE: u32 = 1 << 3;
const CCMR1_OC1M_PWM1: u32 = 0b110 << 4;
const CCMR1_OC2PE: u32 = 1 << 11;
const CCMR1_OC2M_PWM2: u32 = 0b111 << 12;
// TIMx_CCER
const CCER_CC1E: u32 = 1 << 0;
const CCER_CC1NE: u32 = 1 << 2;
// TIMx_EGR
const EGR_UG: u32 = 1 << 0;
// TIMx_SR
const SR_BIF: u32 = 1 << 7;
// TIMx_BDTR
const BDTR_DTG_MASK: u32 = 0xFF;
const BDTR_OSSI: u32 = 1 << 10;
const BDTR_BKE: u32 = 1 << 12;
const BDTR_BKP: u32 = 1 << 13;
const BDTR_MOE: u32 = 1 << 15;
/// Break filter, 8 samples at f_DTS / 4
const BDTR_BKF: u32 = 0b0111 << 16;
// TIMx_DTR2
const DTR2_DTGF_MASK: u32 = 0xFF;
const DTR2_DTAE: u32 = 1 << 16;
// TIMx_CR2 idle output levels of channel 1
const CR2_OIS1: u32 = 1 << 8;
const CR2_OIS1N: u32 = 1 << 9;

/// Break input of TIM1 on PA6
const FAULT_PIN: usize = 6;

fn read_raw<T: Copy, A: Access>(reg: Reg<T, A>) -> u32 {
    // SAFETY: timer and GPIO registers are word aligned and at least 16 bits wide
    unsafe { (reg.as_ptr() as *const u32).read_volatile() }
}

fn write_raw<T: Copy, A: Access>(reg: Reg<T, A>, value: u32) {
    // SAFETY: see read_raw
    unsafe { (reg.as_ptr() as *mut u32).write_volatile(value) }
}

fn modify_raw<T: Copy, A: Access>(reg: Reg<T, A>, clear: u32, set: u32) {
    write_raw(reg, (read_raw(reg) & !clear) | set);
}

/// Encodes a dead time in t_DTS counts into the 8-bit DTG format.
/// Saturates at 1008 counts.
pub fn encode_dead_time(counts: u16) -> u8 {
    let c = counts as u32;
    let dtg = match c {
        0..=127 => c,
        128..=254 => 0b1000_0000 | (c / 2 - 64),
        255..=504 => 0b1100_0000 | (c / 8 - 32),
        505..=1008 => 0b1110_0000 | (c / 16 - 32),
        _ => 0xFF,
    };
    dtg as u8
}

fn tim(timer: Timer) -> pac::timer::TimAdv {
    match timer {
        Timer::T0 => pac::TIM1,
        Timer::T1 => pac::TIM8,
    }
}

/// Register level access to TIM1 and TIM8.
///
/// The HAL drivers stay alive so the pins keep their alternate function
/// and the timer clocks stay enabled.
pub struct Stm32PwmRegs {
    _lead: ComplementaryPwm<'static, TIM1>,
    _lag: ComplementaryPwm<'static, TIM8>,
    fault_polarity: FaultPolarity,
}

impl Stm32PwmRegs {
    pub fn new(lead: ComplementaryPwm<'static, TIM1>, lag: ComplementaryPwm<'static, TIM8>) -> Self {
        Self {
            _lead: lead,
            _lag: lag,
            fault_polarity: FaultPolarity::ActiveLow,
        }
    }
}

impl PwmRegisters for Stm32PwmRegs {
    fn set_prescalers(&mut self, base_clk_prescale: u32, timer_clk_prescale: u32) {
        // CKD divides the kernel clock into the dead-time clock
        let ckd = match base_clk_prescale {
            1 => 0b00,
            2 => 0b01,
            _ => 0b10,
        };
        let psc = base_clk_prescale * timer_clk_prescale - 1;
        for timer in [Timer::T0, Timer::T1] {
            let t = tim(timer);
            modify_raw(t.cr1(), 0b11 << CR1_CKD_SHIFT, ckd << CR1_CKD_SHIFT);
            write_raw(t.psc(), psc);
        }
    }

    fn setup_timers(&mut self, mode: PwmMode) {
        let cms = match mode {
            PwmMode::UpCounting => 0,
            PwmMode::UpDownCounting => CR1_CMS_CENTER1,
        };
        for timer in [Timer::T0, Timer::T1] {
            let t = tim(timer);
            modify_raw(t.cr1(), CR1_CEN | (0b11 << 5), cms | CR1_ARPE);
            write_raw(t.ccmr_output(0), CCMR1_OC1PE | CCMR1_OC1M_PWM1);
            write_raw(t.ccer(), CCER_CC1E | CCER_CC1NE);
            modify_raw(t.dtr2(), 0, DTR2_DTAE);
        }
        let lead = tim(Timer::T0);
        // OC2REF of the lead timer rises at the phase count and resets the lag timer
        modify_raw(lead.ccmr_output(0), 0, CCMR1_OC2PE | CCMR1_OC2M_PWM2);
        modify_raw(lead.cr2(), 0b111 << 4, CR2_MMS_OC2REF);
        write_raw(tim(Timer::T1).smcr(), SMCR_SMS_RESET);
        for timer in [Timer::T0, Timer::T1] {
            let t = tim(timer);
            write_raw(t.egr(), EGR_UG);
            modify_raw(t.cr1(), 0, CR1_CEN);
        }
        log_debug!("stm32: TIM1/TIM8 started, {:?}", mode);
    }

    fn setup_fault_handler(&mut self, lead: DisableAction, lag: DisableAction) {
        for (timer, action) in [(Timer::T0, lead), (Timer::T1, lag)] {
            let t = tim(timer);
            let idle = match action {
                DisableAction::ForceHigh => CR2_OIS1 | CR2_OIS1N,
                _ => 0,
            };
            modify_raw(t.cr2(), CR2_OIS1 | CR2_OIS1N, idle);
            // NoChange releases the pins instead of driving an idle level
            let ossi = match action {
                DisableAction::NoChange => 0,
                _ => BDTR_OSSI,
            };
            modify_raw(t.bdtr(), BDTR_OSSI | BDTR_MOE, ossi | BDTR_BKF);
        }
    }

    fn set_period(&mut self, timer: Timer, top: u16) {
        write_raw(tim(timer).arr(), top as u32);
    }

    fn set_phase(&mut self, timer: Timer, phase: u16) {
        // OC2REF needs a rising edge, so zero shift is one count
        if timer == Timer::T1 {
            write_raw(tim(Timer::T0).ccr(1), phase.max(1) as u32);
        }
    }

    fn period(&self, timer: Timer) -> u16 {
        read_raw(tim(timer).arr()) as u16
    }

    fn set_compare(&mut self, timer: Timer, cmp: Compare, value: u16) {
        // Channel 1N is the complement of channel 1, compare B has no register
        if cmp == Compare::A {
            write_raw(tim(timer).ccr(0), value as u32);
        }
    }

    fn set_dead_band(&mut self, timer: Timer, red: u16, fed: u16) {
        let t = tim(timer);
        modify_raw(t.bdtr(), BDTR_DTG_MASK, encode_dead_time(red) as u32);
        modify_raw(t.dtr2(), DTR2_DTGF_MASK, encode_dead_time(fed) as u32);
    }

    fn force_one_shot(&mut self, timer: Timer) {
        modify_raw(tim(timer).bdtr(), BDTR_MOE, 0);
    }

    fn clear_one_shot(&mut self, timer: Timer) {
        modify_raw(tim(timer).bdtr(), 0, BDTR_MOE);
    }

    fn sync_software(&mut self, timer: Timer) {
        write_raw(tim(timer).egr(), EGR_UG);
    }

    fn enable_hw_fault(&mut self, polarity: FaultPolarity) {
        self.fault_polarity = polarity;
        let bkp = match polarity {
            FaultPolarity::ActiveHigh => BDTR_BKP,
            FaultPolarity::ActiveLow => 0,
        };
        for timer in [Timer::T0, Timer::T1] {
            let t = tim(timer);
            modify_raw(t.bdtr(), BDTR_BKP, bkp | BDTR_BKE);
            // rc_w0
            write_raw(t.sr(), !SR_BIF);
        }
    }

    fn disable_hw_fault(&mut self) {
        for timer in [Timer::T0, Timer::T1] {
            modify_raw(tim(timer).bdtr(), BDTR_BKE, 0);
        }
    }

    fn hw_fault_present(&self) -> bool {
        let high = read_raw(pac::GPIOA.idr()) & (1 << FAULT_PIN) != 0;
        match self.fault_polarity {
            FaultPolarity::ActiveHigh => high,
            FaultPolarity::ActiveLow => !high,
        }
    }

    fn hw_fault_event(&self) -> bool {
        read_raw(tim(Timer::T0).sr()) & SR_BIF != 0 || read_raw(tim(Timer::T1).sr()) & SR_BIF != 0
    }

    fn clear_hw_fault_event(&mut self) {
        for timer in [Timer::T0, Timer::T1] {
            write_raw(tim(timer).sr(), !SR_BIF);
        }
    }
}

/// Routes TIM1_BKIN to PA6 (AF6), TIM8_BKIN to PB7 (AF10).
///
/// Both pins carry the same over-current signal on the power board.
pub fn route_break_inputs() {
    fn alternate(port: pac::gpio::Gpio, pin: usize, af: u32) {
        modify_raw(port.moder(), 0b11 << (2 * pin), 0b10 << (2 * pin));
        let afr = port.afr(pin / 8);
        let shift = 4 * (pin % 8);
        modify_raw(afr, 0xF << shift, af << shift);
    }
    alternate(pac::GPIOA, FAULT_PIN, 6);
    alternate(pac::GPIOB, 7, 10);
}

/// One ADC shared by both temperature inputs.
pub type SharedAdc = RefCell<Adc<'static, ADC1>>;

pub struct AdcSampler {
    adc: &'static SharedAdc,
    channel: AnyAdcChannel<ADC1>,
}

impl AdcSampler {
    pub fn new(adc: &'static SharedAdc, channel: AnyAdcChannel<ADC1>) -> Self {
        Self { adc, channel }
    }
}

impl RawSampler for AdcSampler {
    type Error = Infallible;

    fn sample(&mut self) -> Result<u16, Self::Error> {
        Ok(self.adc.borrow_mut().blocking_read(&mut self.channel))
    }
}

/// Factory VREFINT reading at 3.0 V analog supply
const VREFINT_CAL_ADDR: usize = 0x1FFF_75AA;
const VREFINT_CAL_MV: u32 = 3000;

/// Analog supply voltage in mV from a VREFINT conversion.
pub fn measure_vref_mv(adc: &mut Adc<'static, ADC1>) -> Option<u32> {
    let mut vrefint = adc.enable_vrefint();
    let raw = adc.blocking_read(&mut vrefint) as u32;
    // SAFETY: factory programmed, read-only system memory
    let cal = unsafe { (VREFINT_CAL_ADDR as *const u16).read_volatile() } as u32;
    if raw == 0 || cal == 0 || cal == 0xFFFF {
        return None;
    }
    Some(VREFINT_CAL_MV * cal / raw)
}

/// Current limit reference on channel 1 of TIM4.
pub struct RefPwm {
    pwm: SimplePwm<'static, TIM4>,
    duty: u16,
}

impl RefPwm {
    pub fn new(pwm: SimplePwm<'static, TIM4>) -> Self {
        Self { pwm, duty: 0 }
    }
}

impl embedded_hal::PwmPin for RefPwm {
    type Duty = u16;

    fn disable(&mut self) {
        self.pwm.ch1().disable();
    }

    fn enable(&mut self) {
        self.pwm.ch1().enable();
    }

    fn get_duty(&self) -> u16 {
        self.duty
    }

    fn get_max_duty(&self) -> u16 {
        self.pwm.max_duty_cycle()
    }

    fn set_duty(&mut self, duty: u16) {
        self.duty = duty;
        self.pwm.ch1().set_duty_cycle(duty);
    }
}

/// Pushes events to all connected event stream clients.
pub struct SseSink {
    publisher: ImmediatePublisher<'static, CriticalSectionRawMutex, SseMessage, SSE_QUEUE_LEN, SSE_MAX_CLIENTS, 1>,
}

impl SseSink {
    pub fn new(channel: &'static SseChannel) -> Self {
        Self {
            publisher: channel.immediate_publisher(),
        }
    }
}

impl PushSink for SseSink {
    fn send(&mut self, payload: &str, event: &'static str) {
        let mut data = String::new();
        if data.push_str(payload).is_err() {
            log_warn!("SSE: payload of {} bytes dropped", payload.len());
            return;
        }
        // Without subscribers the message is dropped
        self.publisher.publish_immediate(SseMessage { event, data });
    }
}

pub type SettingsFlash = Flash<'static, Blocking>;

/// Settings live in the last erase sector of the internal flash.
pub fn settings_store(flash: SettingsFlash) -> FlashBlobStore<SettingsFlash> {
    use embedded_storage::nor_flash::NorFlash;
    let offset = (embassy_stm32::flash::FLASH_SIZE - <SettingsFlash as NorFlash>::ERASE_SIZE) as u32;
    FlashBlobStore::new(flash, offset)
}

pub struct Stm32Board;

impl Board for Stm32Board {
    type PwmRegs = Stm32PwmRegs;
    type Pin = Output<'static>;
    type RefPwm = RefPwm;
    type Adc = AdcSampler;
    type Store = FlashBlobStore<SettingsFlash>;
    type Sink = SseSink;
}
