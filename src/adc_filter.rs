//! Moving average filter and equidistant piecewise-linear interpolation.

/// Moving average over the last `N` samples.
///
/// `N` must be a power of two and at most 2^16 so that the running sum of
/// 16-bit samples fits into 32 bits.
pub struct MovingAverage<const N: usize> {
    buf: [u16; N],
    pos: usize,
    sum: u32,
}

impl<const N: usize> MovingAverage<N> {
    const MASK: usize = N - 1;
    const SHIFT: u32 = N.trailing_zeros();
    const VALID_LEN: () = assert!(N.is_power_of_two() && N <= 1 << 16);

    /// New filter with every slot pre-filled with `init`.
    pub fn new(init: u16) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_LEN;
        Self {
            buf: [init; N],
            pos: 0,
            sum: init as u32 * N as u32,
        }
    }

    /// Replaces the oldest sample.
    pub fn push(&mut self, sample: u16) {
        self.sum -= self.buf[self.pos] as u32;
        self.sum += sample as u32;
        self.buf[self.pos] = sample;
        self.pos = (self.pos + 1) & Self::MASK;
    }

    pub fn value(&self) -> u16 {
        (self.sum >> Self::SHIFT) as u16
    }

    /// Fills every slot with `value`.
    pub fn reset(&mut self, value: u16) {
        self.buf = [value; N];
        self.sum = value as u32 * N as u32;
        self.pos = 0;
    }
}

/// Piecewise-linear function of `N` values at equidistant points spanning
/// `[bot, top]`. Inputs outside the range clamp to the end values.
#[derive(Debug, Clone)]
pub struct EquidistantPwl<const N: usize> {
    lut: [f32; N],
    bot: i32,
    top: i32,
}

impl<const N: usize> EquidistantPwl<N> {
    const VALID_LEN: () = assert!(N >= 2);

    pub fn new(lut: [f32; N], bot: i32, top: i32) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_LEN;
        debug_assert!(top > bot);
        Self { lut, bot, top }
    }

    pub fn bot(&self) -> i32 {
        self.bot
    }

    pub fn top(&self) -> i32 {
        self.top
    }

    pub fn interpolate(&self, x: i32) -> f32 {
        if x <= self.bot {
            return self.lut[0];
        }
        if x >= self.top {
            return self.lut[N - 1];
        }
        let span = (self.top - self.bot) as i64;
        let n = (N as i64 - 1) * (x - self.bot) as i64;
        let quot = (n / span) as usize;
        let rem = (n % span) as f32;
        let y0 = self.lut[quot];
        let y1 = self.lut[quot + 1];
        y0 + rem / span as f32 * (y1 - y0)
    }
}
