use defmt::*;
use embassy_futures::select::{select, Either};
use embassy_stm32::wdg::IndependentWatchdog;
use embassy_time::{Instant, Timer};

use psfb_controller::app_controller::Controller;
use psfb_controller::stm32_board::Stm32Board;

use crate::{COMMANDS, EVENT_BITS};

/// Sole owner of the controller. Sleeps on the event bits and the next
/// multi-shot timer deadline, whichever comes first.
#[embassy_executor::task]
pub async fn controller_task(
    controller: &'static mut Controller<'static, Stm32Board>,
    mut wdg: IndependentWatchdog<'static, embassy_stm32::peripherals::IWDG>,
) {
    controller.begin(Instant::now());
    info!("Controller running, power state {}", controller.core().power_state());
    loop {
        let bits = match controller.next_deadline() {
            Some(deadline) => match select(EVENT_BITS.wait(), Timer::at(deadline)).await {
                Either::First(bits) => bits,
                Either::Second(()) => 0,
            },
            None => EVENT_BITS.wait().await,
        };
        let now = Instant::now();
        controller.poll_timers(now);
        if bits != 0 {
            controller.service(now, bits, &COMMANDS);
        }
        // Fed on every wake; the fast tick keeps the interval short
        wdg.pet();
    }
}
