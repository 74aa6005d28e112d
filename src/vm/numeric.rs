//! Numeric semantics of the arithmetic, shift, conversion and comparison
//! instructions.
//!
//! Integer arithmetic wraps on overflow (`i32::MIN / -1 == i32::MIN`).
//! Division by zero is reported as `None`; the interpreter turns it into
//! `ArithmeticException`. Rust's float-to-int `as` casts already saturate
//! and send NaN to zero, which is exactly the `f2i`/`d2l` family.

use std::cmp::Ordering;

/// `idiv`. `None` on a zero divisor.
pub fn idiv(a: i32, b: i32) -> Option<i32> {
    (b != 0).then(|| a.wrapping_div(b))
}

/// `irem`. The sign follows the dividend.
pub fn irem(a: i32, b: i32) -> Option<i32> {
    (b != 0).then(|| a.wrapping_rem(b))
}

pub fn ldiv(a: i64, b: i64) -> Option<i64> {
    (b != 0).then(|| a.wrapping_div(b))
}

pub fn lrem(a: i64, b: i64) -> Option<i64> {
    (b != 0).then(|| a.wrapping_rem(b))
}

// Shift distances use only the low 5 (int) or 6 (long) bits.

pub fn ishl(a: i32, s: i32) -> i32 {
    a.wrapping_shl((s & 0x1f) as u32)
}

pub fn ishr(a: i32, s: i32) -> i32 {
    a >> (s & 0x1f)
}

pub fn iushr(a: i32, s: i32) -> i32 {
    ((a as u32) >> (s & 0x1f)) as i32
}

pub fn lshl(a: i64, s: i32) -> i64 {
    a.wrapping_shl((s & 0x3f) as u32)
}

pub fn lshr(a: i64, s: i32) -> i64 {
    a >> (s & 0x3f)
}

pub fn lushr(a: i64, s: i32) -> i64 {
    ((a as u64) >> (s & 0x3f)) as i64
}

/// `frem`: truncated remainder, like C `fmod`.
pub fn frem(a: f32, b: f32) -> f32 {
    a % b
}

pub fn drem(a: f64, b: f64) -> f64 {
    a % b
}

pub fn f2i(f: f32) -> i32 {
    f as i32
}

pub fn f2l(f: f32) -> i64 {
    f as i64
}

pub fn d2i(d: f64) -> i32 {
    d as i32
}

pub fn d2l(d: f64) -> i64 {
    d as i64
}

pub fn i2b(n: i32) -> i32 {
    n as i8 as i32
}

pub fn i2c(n: i32) -> i32 {
    n as u16 as i32
}

pub fn i2s(n: i32) -> i32 {
    n as i16 as i32
}

pub fn lcmp(a: i64, b: i64) -> i32 {
    match a.cmp(&b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// `fcmpl` (`nan = -1`) and `fcmpg` (`nan = 1`).
pub fn fcmp(a: f32, b: f32, nan: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Greater) => 1,
        None => nan,
    }
}

/// `dcmpl` (`nan = -1`) and `dcmpg` (`nan = 1`).
pub fn dcmp(a: f64, b: f64, nan: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Greater) => 1,
        None => nan,
    }
}
