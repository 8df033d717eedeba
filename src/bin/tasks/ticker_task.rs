use embassy_time::{Duration, Ticker};

use crate::EVENT_BITS;

/// Raises `bit` every `period`. Never touches the controller state.
#[embassy_executor::task(pool_size = 2)]
pub async fn ticker_task(period: Duration, bit: u8) {
    let mut ticker = Ticker::every(period);
    loop {
        ticker.next().await;
        EVENT_BITS.raise(bit);
    }
}
