//! Deterministic pseudo random generator for scripts
//!
//! `math.random` inside a script must produce the same sequence on every
//! node that replays the script, independently of the platform C library.
//! This is the 48-bit linear congruential generator of POSIX `lrand48`,
//! carried out with 64-bit arithmetic.

const MULTIPLIER: u64 = 0x5_DEEC_E66D;
const ADDEND: u64 = 0xB;
const MASK: u64 = (1 << 48) - 1;
const SEED_LOW: u64 = 0x330E;
const UNSEEDED: u64 = 0x1234_ABCD_330E;

/// Largest value returned by [`Lrand48::next_i32`]
pub const LRAND48_MAX: i32 = i32::MAX;

/// Requested integer interval contains no values
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interval is empty")]
pub struct EmptyInterval {
    /// 1-based position of the offending argument
    pub argument: usize,
}

/// `lrand48` compatible generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lrand48 {
    state: u64,
}

impl Default for Lrand48 {
    fn default() -> Self {
        Lrand48 { state: UNSEEDED }
    }
}

impl Lrand48 {
    /// Generator seeded with `seed`
    pub fn new(seed: i32) -> Self {
        let mut rng = Self::default();
        rng.seed(seed);
        rng
    }

    /// Reset the sequence; only the low 32 bits of the seed matter
    pub fn seed(&mut self, seed: i32) {
        self.state = (((seed as u32) as u64) << 16 | SEED_LOW) & MASK;
    }

    /// Next value in `0..=LRAND48_MAX`
    pub fn next_i32(&mut self) -> i32 {
        self.state = MULTIPLIER.wrapping_mul(self.state).wrapping_add(ADDEND) & MASK;
        (self.state >> 17) as i32
    }

    /// Next value in `[0, 1)`
    pub fn next_unit(&mut self) -> f64 {
        (self.next_i32() % LRAND48_MAX) as f64 / LRAND48_MAX as f64
    }

    /// Integer in `[1, upper]` as a Lua number
    ///
    /// A value is drawn even when the interval is empty, so failed calls
    /// advance the sequence exactly like successful ones.
    pub fn next_upto(&mut self, upper: i32) -> Result<f64, EmptyInterval> {
        let r = self.next_unit();
        if upper < 1 {
            return Err(EmptyInterval { argument: 1 });
        }
        Ok((r * upper as f64).floor() + 1.0)
    }

    /// Integer in `[lower, upper]` as a Lua number
    pub fn next_between(&mut self, lower: i32, upper: i32) -> Result<f64, EmptyInterval> {
        let r = self.next_unit();
        if lower > upper {
            return Err(EmptyInterval { argument: 2 });
        }
        let span = upper as i64 - lower as i64 + 1;
        Ok((r * span as f64).floor() + lower as f64)
    }
}
