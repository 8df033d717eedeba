// On-target smoke tests of the board binding, run through probe-rs.
#![no_std]
#![no_main]

use {defmt_rtt as _, panic_probe as _};

#[defmt_test::tests]
mod tests {
    use defmt::{assert, assert_eq, info};
    use embassy_stm32::adc::{Adc, SampleTime};
    use embassy_stm32::flash::Flash;
    use embassy_stm32::gpio::OutputType;
    use embassy_stm32::peripherals::ADC1;
    use embassy_stm32::time::khz;
    use embassy_stm32::timer::complementary_pwm::{ComplementaryPwm, ComplementaryPwmPin};
    use embassy_stm32::timer::low_level::CountingMode;
    use embassy_stm32::timer::simple_pwm::PwmPin;

    use psfb_controller::ps_pwm::{PwmRegisters, Timer};
    use psfb_controller::settings_store::{BlobStore, FlashBlobStore};
    use psfb_controller::stm32_board::{
        encode_dead_time, measure_vref_mv, settings_store, SettingsFlash, Stm32PwmRegs,
    };

    struct Board {
        regs: Stm32PwmRegs,
        adc: Adc<'static, ADC1>,
        store: FlashBlobStore<SettingsFlash>,
    }

    #[init]
    fn init() -> Board {
        let p = embassy_stm32::init(Default::default());
        info!("Target test setup");
        let lead = ComplementaryPwm::new(
            p.TIM1,
            Some(PwmPin::new_ch1(p.PA8, OutputType::PushPull)),
            Some(ComplementaryPwmPin::new_ch1(p.PA7, OutputType::PushPull)),
            None,
            None,
            None,
            None,
            None,
            None,
            khz(100),
            CountingMode::EdgeAlignedUp,
        );
        let lag = ComplementaryPwm::new(
            p.TIM8,
            Some(PwmPin::new_ch1(p.PC6, OutputType::PushPull)),
            Some(ComplementaryPwmPin::new_ch1(p.PC10, OutputType::PushPull)),
            None,
            None,
            None,
            None,
            None,
            None,
            khz(100),
            CountingMode::EdgeAlignedUp,
        );
        let mut adc = Adc::new(p.ADC1);
        adc.set_sample_time(SampleTime::CYCLES247_5);
        Board {
            regs: Stm32PwmRegs::new(lead, lag),
            adc,
            store: settings_store(Flash::new_blocking(p.FLASH)),
        }
    }

    #[test]
    fn dead_time_encoding_ranges() {
        assert_eq!(encode_dead_time(12), 12);
        assert_eq!(encode_dead_time(200), 0b1000_0000 | 36);
        assert_eq!(encode_dead_time(400), 0b1100_0000 | 18);
        assert_eq!(encode_dead_time(5000), 0xFF);
    }

    #[test]
    fn period_register_reads_back(board: &mut Board) {
        board.regs.set_period(Timer::T0, 99);
        board.regs.set_period(Timer::T1, 66);
        assert_eq!(board.regs.period(Timer::T0), 99);
        assert_eq!(board.regs.period(Timer::T1), 66);
    }

    #[test]
    fn software_trip_is_not_a_hardware_fault(board: &mut Board) {
        board.regs.clear_hw_fault_event();
        board.regs.force_one_shot(Timer::T0);
        board.regs.force_one_shot(Timer::T1);
        assert!(!board.regs.hw_fault_event());
    }

    #[test]
    fn supply_voltage_is_plausible(board: &mut Board) {
        let vref = measure_vref_mv(&mut board.adc);
        info!("VDDA {} mV", vref);
        let vref = vref.unwrap_or(0);
        assert!((2900..=3400).contains(&vref));
    }

    #[test]
    fn settings_blob_survives_flash(board: &mut Board) {
        board.store.store("target_test", b"{\"duty\":12.5}").unwrap();
        let mut buf = [0u8; 32];
        let len = board.store.load("target_test", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"{\"duty\":12.5}");
    }
}
