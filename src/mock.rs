//! In-memory stand-ins for the board peripherals, used by the unit tests.

use core::convert::Infallible;
use std::collections::VecDeque;
use std::string::String;
use std::vec::Vec;

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash,
};

use crate::adc_channel::RawSampler;
use crate::api_server::PushSink;
use crate::board::Board;
use crate::ps_pwm::{Compare, DisableAction, FaultPolarity, PwmMode, PwmRegisters, Timer};
use crate::settings_store::FlashBlobStore;

fn idx(timer: Timer) -> usize {
    match timer {
        Timer::T0 => 0,
        Timer::T1 => 1,
    }
}

/// Register write log entry, recorded in call order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegOp {
    Prescalers(u32, u32),
    SetupTimers(PwmMode),
    SetupFaultHandler(DisableAction, DisableAction),
    Period(Timer, u16),
    Phase(Timer, u16),
    Compare(Timer, Compare, u16),
    DeadBand(Timer, u16, u16),
    ForceOneShot(Timer),
    ClearOneShot(Timer),
    Sync(Timer),
    EnableHwFault(FaultPolarity),
    DisableHwFault,
    ClearFaultEvent,
}

/// PWM register block. The fault input trips both operators like the
/// peripheral does when the hardware fault source is enabled.
#[derive(Debug, Default)]
pub struct MockPwmRegisters {
    pub ops: Vec<RegOp>,
    pub period: [u16; 2],
    pub phase: [u16; 2],
    pub compare: [[u16; 2]; 2],
    pub dead_band: [(u16, u16); 2],
    pub tripped: [bool; 2],
    pub hw_fault_enabled: Option<FaultPolarity>,
    pub fault_input: bool,
    pub fault_event: bool,
}

impl MockPwmRegisters {
    /// Asserts the fault input, as the external overcurrent latch does.
    pub fn trip_by_hw_fault(&mut self) {
        self.fault_input = true;
        if self.hw_fault_enabled.is_some() {
            self.fault_event = true;
            self.tripped = [true, true];
        }
    }
}

impl PwmRegisters for MockPwmRegisters {
    fn set_prescalers(&mut self, base_clk_prescale: u32, timer_clk_prescale: u32) {
        self.ops.push(RegOp::Prescalers(base_clk_prescale, timer_clk_prescale));
    }

    fn setup_timers(&mut self, mode: PwmMode) {
        self.ops.push(RegOp::SetupTimers(mode));
    }

    fn setup_fault_handler(&mut self, lead: DisableAction, lag: DisableAction) {
        self.ops.push(RegOp::SetupFaultHandler(lead, lag));
    }

    fn set_period(&mut self, timer: Timer, top: u16) {
        self.ops.push(RegOp::Period(timer, top));
        self.period[idx(timer)] = top;
    }

    fn set_phase(&mut self, timer: Timer, phase: u16) {
        self.ops.push(RegOp::Phase(timer, phase));
        self.phase[idx(timer)] = phase;
    }

    fn period(&self, timer: Timer) -> u16 {
        self.period[idx(timer)]
    }

    fn set_compare(&mut self, timer: Timer, cmp: Compare, value: u16) {
        self.ops.push(RegOp::Compare(timer, cmp, value));
        let c = match cmp {
            Compare::A => 0,
            Compare::B => 1,
        };
        self.compare[idx(timer)][c] = value;
    }

    fn set_dead_band(&mut self, timer: Timer, red: u16, fed: u16) {
        self.ops.push(RegOp::DeadBand(timer, red, fed));
        self.dead_band[idx(timer)] = (red, fed);
    }

    fn force_one_shot(&mut self, timer: Timer) {
        self.ops.push(RegOp::ForceOneShot(timer));
        self.tripped[idx(timer)] = true;
    }

    fn clear_one_shot(&mut self, timer: Timer) {
        self.ops.push(RegOp::ClearOneShot(timer));
        self.tripped[idx(timer)] = false;
    }

    fn sync_software(&mut self, timer: Timer) {
        self.ops.push(RegOp::Sync(timer));
    }

    fn enable_hw_fault(&mut self, polarity: FaultPolarity) {
        self.ops.push(RegOp::EnableHwFault(polarity));
        self.hw_fault_enabled = Some(polarity);
    }

    fn disable_hw_fault(&mut self) {
        self.ops.push(RegOp::DisableHwFault);
        self.hw_fault_enabled = None;
    }

    fn hw_fault_present(&self) -> bool {
        self.fault_input
    }

    fn hw_fault_event(&self) -> bool {
        self.fault_event
    }

    fn clear_hw_fault_event(&mut self) {
        self.ops.push(RegOp::ClearFaultEvent);
        self.fault_event = false;
    }
}

/// Digital output remembering every level written.
#[derive(Debug, Default)]
pub struct MockPin {
    pub high: bool,
    pub history: Vec<bool>,
}

impl embedded_hal::digital::v2::OutputPin for MockPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high = false;
        self.history.push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high = true;
        self.history.push(true);
        Ok(())
    }
}

pub const MOCK_PWM_MAX_DUTY: u16 = 1000;

#[derive(Debug, Default)]
pub struct MockPwmPin {
    pub duty: u16,
    pub enabled: bool,
}

impl embedded_hal::PwmPin for MockPwmPin {
    type Duty = u16;

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn get_duty(&self) -> u16 {
        self.duty
    }

    fn get_max_duty(&self) -> u16 {
        MOCK_PWM_MAX_DUTY
    }

    fn set_duty(&mut self, duty: u16) {
        self.duty = duty;
    }
}

/// ADC returning queued conversions first, then a constant raw value.
#[derive(Debug, Default)]
pub struct MockAdc {
    pub raw: u16,
    pub queued: VecDeque<u16>,
    pub fail: bool,
}

impl MockAdc {
    pub fn new(raw: u16) -> Self {
        Self {
            raw,
            ..Default::default()
        }
    }

    pub fn queue(&mut self, values: &[u16]) {
        self.queued.extend(values.iter().copied());
    }

    pub fn set_raw(&mut self, raw: u16) {
        self.raw = raw;
    }
}

impl RawSampler for MockAdc {
    type Error = ();

    fn sample(&mut self) -> Result<u16, ()> {
        if self.fail {
            return Err(());
        }
        Ok(self.queued.pop_front().unwrap_or(self.raw))
    }
}

pub const MOCK_FLASH_SECTOR: usize = 2048;
pub const MOCK_FLASH_SECTORS: usize = 2;

/// NOR flash with the STM32G4 write and erase granularity. Writes can only
/// clear bits.
#[derive(Debug)]
pub struct MockFlash {
    pub storage: Vec<u8>,
    pub erase_count: u32,
}

impl MockFlash {
    pub fn new() -> Self {
        Self {
            storage: vec![0xFF; MOCK_FLASH_SECTOR * MOCK_FLASH_SECTORS],
            erase_count: 0,
        }
    }

    fn check(&self, offset: u32, len: usize, align: usize) -> Result<(), NorFlashErrorKind> {
        let offset = offset as usize;
        if offset % align != 0 || len % align != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if offset + len > self.storage.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        Ok(())
    }
}

impl Default for MockFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorType for MockFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MockFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len(), Self::READ_SIZE)?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.storage[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.storage.len()
    }
}

impl NorFlash for MockFlash {
    const WRITE_SIZE: usize = 8;
    const ERASE_SIZE: usize = MOCK_FLASH_SECTOR;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if to < from {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        self.check(from, (to - from) as usize, Self::ERASE_SIZE)?;
        self.storage[from as usize..to as usize].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len(), Self::WRITE_SIZE)?;
        let start = offset as usize;
        for (cell, byte) in self.storage[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

/// Push sink collecting every event.
#[derive(Debug, Default)]
pub struct MockSink {
    pub sent: Vec<(&'static str, String)>,
}

impl MockSink {
    pub fn count(&self, event: &str) -> usize {
        self.sent.iter().filter(|(e, _)| *e == event).count()
    }

    pub fn last(&self, event: &str) -> Option<&str> {
        self.sent
            .iter()
            .rev()
            .find(|(e, _)| *e == event)
            .map(|(_, p)| p.as_str())
    }
}

impl PushSink for MockSink {
    fn send(&mut self, payload: &str, event: &'static str) {
        self.sent.push((event, String::from(payload)));
    }
}

pub struct MockBoard;

impl Board for MockBoard {
    type PwmRegs = MockPwmRegisters;
    type Pin = MockPin;
    type RefPwm = MockPwmPin;
    type Adc = MockAdc;
    type Store = FlashBlobStore<MockFlash>;
    type Sink = MockSink;
}
