#![no_std]
#![no_main]

#[path = "tasks/controller_task.rs"]
mod controller_task;
#[path = "tasks/http_task.rs"]
mod http_task;
#[path = "tasks/net_task.rs"]
mod net_task;
#[path = "tasks/ticker_task.rs"]
mod ticker_task;

use core::cell::RefCell;

use defmt::*;
use embassy_executor::Spawner;
use embassy_net::StackResources;
use embassy_net_wiznet::chip::W5500;
use embassy_stm32::adc::{Adc, AdcChannel, SampleTime};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::flash::Flash;
use embassy_stm32::gpio::{Level, Output, OutputType, Pull, Speed};
use embassy_stm32::spi::{self, Spi};
use embassy_stm32::time::{khz, mhz};
use embassy_stm32::timer::complementary_pwm::{ComplementaryPwm, ComplementaryPwmPin};
use embassy_stm32::timer::low_level::CountingMode;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};
use embassy_stm32::wdg::IndependentWatchdog;
use embassy_stm32::{rcc, Config};
use embassy_time::{Delay, Duration};
use embedded_hal_bus::spi::ExclusiveDevice;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use psfb_controller::adc_channel::{AdcCalibration, DEFAULT_VREF_MV};
use psfb_controller::api_server::CommandQueue;
use psfb_controller::app_config::{APP_CONSTANTS, AUX_HW_CONFIG};
use psfb_controller::app_controller::Controller;
use psfb_controller::aux_hw_drv::{AuxHwDrv, AuxHwState, AuxPins};
use psfb_controller::event_bits::{EventBits, EVT_TICK_FAST, EVT_TICK_SLOW};
use psfb_controller::ps_pwm::PwmMode;
use psfb_controller::sensor_kty81::{Kty81Sensor, Kty81Variant};
use psfb_controller::stm32_board::{
    measure_vref_mv, route_break_inputs, settings_store, AdcSampler, RefPwm, SharedAdc, SseChannel,
    SseSink, Stm32Board, Stm32PwmRegs,
};

use crate::controller_task::controller_task;
use crate::http_task::{http_task, HTTP_WORKERS};
use crate::net_task::{ethernet_task, net_task};
use crate::ticker_task::ticker_task;

pub static EVENT_BITS: EventBits = EventBits::new();
pub static COMMANDS: CommandQueue = CommandQueue::new();
pub static SSE_EVENTS: SseChannel = SseChannel::new();

/// Watchdog timeout, twenty fast ticks
const WATCHDOG_TIMEOUT_US: u32 = 1_000_000;

// Pin map
//
// TIM1 CH1 / CH1N   PA8 / PA7    lead leg high / low side
// TIM8 CH1 / CH1N   PC6 / PC10   lag leg high / low side
// TIM1 / TIM8 BKIN  PA6 / PB7    overcurrent fault, active low
// TIM4 CH1          PB6          current limit reference
// ADC1 IN1 / IN2    PA0 / PA1    KTY81 temperature sensors
// PB0 relay ref, PB1 relay DUT, PB2 fan, PB10 driver supply,
// PB11 driver disable, PB12 overcurrent latch reset
// SPI2 PB13 / PB14 / PB15, CS PB9, INT PC7, RST PC8   W5500

fn clock_config() -> Config {
    let mut config = Config::default();
    // HSI 16 MHz / 4 * 80 / 2 = 160 MHz
    config.rcc.pll = Some(rcc::Pll {
        source: rcc::PllSource::HSI,
        prediv: rcc::PllPreDiv::DIV4,
        mul: rcc::PllMul::MUL80,
        divp: None,
        divq: None,
        divr: Some(rcc::PllRDiv::DIV2),
    });
    config.rcc.sys = rcc::Sysclk::PLL1_R;
    config.rcc.boost = true;
    config
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_stm32::init(clock_config());
    info!("PS-FB controller starting");

    let mut wdg = IndependentWatchdog::new(p.IWDG, WATCHDOG_TIMEOUT_US);
    wdg.unleash();

    // The board binding drives the compare outputs only
    assert_eq!(APP_CONSTANTS.pwm_mode, PwmMode::UpCounting);

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
    route_break_inputs();
    let pwm_regs = Stm32PwmRegs::new(lead, lag);

    let pins = AuxPins {
        relay_ref: Output::new(p.PB0, Level::Low, Speed::Low),
        relay_dut: Output::new(p.PB1, Level::Low, Speed::Low),
        fan: Output::new(p.PB2, Level::Low, Speed::Low),
        drv_supply: Output::new(p.PB10, Level::Low, Speed::Low),
        drv_disable: Output::new(p.PB11, Level::High, Speed::Low),
        oc_reset: Output::new(p.PB12, Level::Low, Speed::Low),
    };
    let ref_pwm = RefPwm::new(SimplePwm::new(
        p.TIM4,
        Some(PwmPin::new_ch1(p.PB6, OutputType::PushPull)),
        None,
        None,
        None,
        khz(100),
        Default::default(),
    ));

    let mut adc = Adc::new(p.ADC1);
    adc.set_sample_time(SampleTime::CYCLES247_5);
    let calibration = AdcCalibration::characterize(None, measure_vref_mv(&mut adc), DEFAULT_VREF_MV);
    static ADC: StaticCell<SharedAdc> = StaticCell::new();
    let adc = ADC.init(RefCell::new(adc));
    let temp_1 = Kty81Sensor::new(
        AdcSampler::new(adc, p.PA0.degrade_adc()),
        calibration,
        Kty81Variant::Kty81_121,
    )
    .unwrap();
    let temp_2 = Kty81Sensor::new(
        AdcSampler::new(adc, p.PA1.degrade_adc()),
        calibration,
        Kty81Variant::Kty81_121,
    )
    .unwrap();
    let aux = AuxHwDrv::new(
        pins,
        ref_pwm,
        temp_1,
        temp_2,
        AUX_HW_CONFIG,
        AuxHwState::default(),
    )
    .unwrap();

    let store = settings_store(Flash::new_blocking(p.FLASH));

    static CONTROLLER: StaticCell<Controller<'static, Stm32Board>> = StaticCell::new();
    let controller = CONTROLLER.init(
        Controller::new(
            pwm_regs,
            aux,
            store,
            SseSink::new(&SSE_EVENTS),
            &APP_CONSTANTS,
            &EVENT_BITS,
        )
        .unwrap(),
    );

    spawner.spawn(controller_task(controller, wdg)).unwrap();
    spawner
        .spawn(ticker_task(
            Duration::from_millis(APP_CONSTANTS.timer_fast_interval_ms as u64),
            EVT_TICK_FAST,
        ))
        .unwrap();
    spawner
        .spawn(ticker_task(
            Duration::from_millis(APP_CONSTANTS.timer_slow_interval_ms as u64),
            EVT_TICK_SLOW,
        ))
        .unwrap();

    // Network
    let mut spi_cfg = spi::Config::default();
    spi_cfg.frequency = mhz(20);
    let spi = Spi::new(
        p.SPI2, p.PB13, p.PB15, p.PB14, p.DMA1_CH1, p.DMA1_CH2, spi_cfg,
    );
    let cs = Output::new(p.PB9, Level::High, Speed::VeryHigh);
    let spi_dev = ExclusiveDevice::new(spi, cs, Delay).unwrap();
    let w5500_int = ExtiInput::new(p.PC7, p.EXTI7, Pull::Up);
    let w5500_reset = Output::new(p.PC8, Level::High, Speed::Low);

    // Locally administered address from the device id
    let uid = embassy_stm32::uid::uid();
    let mac_addr = [0x02, uid[0], uid[2], uid[4], uid[6], uid[8]];
    let seed = u64::from_le_bytes([
        uid[0], uid[1], uid[2], uid[3], uid[8], uid[9], uid[10], uid[11],
    ]);

    static WIZNET_STATE: StaticCell<embassy_net_wiznet::State<8, 8>> = StaticCell::new();
    let (device, runner) = embassy_net_wiznet::new::<8, 8, W5500, _, _, _>(
        mac_addr,
        WIZNET_STATE.init(embassy_net_wiznet::State::new()),
        spi_dev,
        w5500_int,
        w5500_reset,
    )
    .await
    .unwrap();
    spawner.spawn(ethernet_task(runner)).unwrap();

    static RESOURCES: StaticCell<StackResources<{ HTTP_WORKERS + 1 }>> = StaticCell::new();
    let (stack, runner) = embassy_net::new(
        device,
        embassy_net::Config::dhcpv4(Default::default()),
        RESOURCES.init(StackResources::new()),
        seed,
    );
    spawner.spawn(net_task(runner)).unwrap();

    info!("Waiting for DHCP...");
    stack.wait_config_up().await;
    if let Some(config) = stack.config_v4() {
        info!("IP address: {}", config.address);
    }

    for _ in 0..HTTP_WORKERS {
        spawner.spawn(http_task(stack, &SSE_EVENTS)).unwrap();
    }
}
