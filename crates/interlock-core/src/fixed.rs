use fixed::types::I32F32;

/// Q32.32 fixed-point: lengths (metres), distances and speeds.
pub type Fixed64 = I32F32;

/// Ticks are the atomic unit of simulation time.
pub type Ticks = u64;

/// Convert an f64 to Fixed64. Use only for initialization, never in sim loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display, never in sim loop.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Number of whole ticks needed to cover `amount` at `rate` per tick,
/// rounded up. A non-positive rate yields `None`.
pub fn ticks_to_cover(amount: Fixed64, rate: Fixed64) -> Option<Ticks> {
    if rate <= Fixed64::ZERO {
        return None;
    }
    let amount = amount.abs();
    let whole = amount.checked_div(rate)?;
    let ticks = whole.ceil().to_num::<u64>();
    Some(ticks)
}
