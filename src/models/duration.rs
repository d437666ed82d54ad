//! Exact duration arithmetic
//!
//! Durations are exact rational multiples of a quarter note, kept in lowest
//! terms (`Rational32` reduces on construction). Arithmetic goes through
//! i64 intermediates; a result whose reduced denominator would not fit is
//! rounded to the nearest multiple of 1/`MAX_DEN` and the rounding is
//! reported back so the caller can queue a diagnostic.

use num_rational::Rational32;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// Largest denominator the engine guarantees to represent exactly.
/// 768 = 256 * 3, covering binary subdivisions down to 1/256 of a quarter
/// plus their triplet variants.
pub const MAX_DEN: i64 = 768;

/// Exact duration as a quarter-note multiple, always in lowest terms
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dur(Rational32);

impl Dur {
    pub fn new(numer: i32, denom: i32) -> Self {
        Dur(Rational32::new(numer, denom))
    }

    pub fn zero() -> Self {
        Dur(Rational32::new(0, 1))
    }

    pub fn from_int(n: i32) -> Self {
        Dur(Rational32::new(n, 1))
    }

    pub fn numer(&self) -> i32 {
        *self.0.numer()
    }

    pub fn denom(&self) -> i32 {
        *self.0.denom()
    }

    pub fn is_zero(&self) -> bool {
        *self.0.numer() == 0
    }

    /// Multiply, rounding to 1/`MAX_DEN` on overflow. The flag reports
    /// whether rounding happened.
    pub fn checked_mul(self, rhs: Dur) -> (Dur, bool) {
        let n = self.numer() as i64 * rhs.numer() as i64;
        let d = self.denom() as i64 * rhs.denom() as i64;
        reduce_i64(n, d)
    }

    /// Add, rounding to 1/`MAX_DEN` on overflow
    pub fn checked_add(self, rhs: Dur) -> (Dur, bool) {
        let n = self.numer() as i64 * rhs.denom() as i64 + rhs.numer() as i64 * self.denom() as i64;
        let d = self.denom() as i64 * rhs.denom() as i64;
        reduce_i64(n, d)
    }

    /// Duration expressed in MusicXML divisions-per-quarter units.
    /// Exact only when `divisions` is a multiple of the denominator;
    /// otherwise rounds to nearest and the caller should have picked a
    /// better divisions value.
    pub fn in_divisions(&self, divisions: i32) -> i32 {
        let n = self.numer() as i64 * divisions as i64;
        let d = self.denom() as i64;
        ((n + d / 2) / d) as i32
    }

    /// Exact display type + dot count for this duration, if one exists.
    /// Covers breve down to 256th with 0..=2 dots.
    pub fn note_type(&self) -> Option<(&'static str, u8)> {
        for (name, base) in NOTE_TYPES {
            for dots in 0u8..=2 {
                // base * (2^(dots+1) - 1) / 2^dots
                let factor = Rational32::new((1i32 << (dots + 1)) - 1, 1 << dots);
                if self.0 == base_value(base) * factor {
                    return Some((name, dots));
                }
            }
        }
        None
    }

    /// Display type + dots, rounding down to the nearest representable
    /// type when no exact match exists. The flag reports inexactness.
    pub fn approx_note_type(&self) -> (&'static str, u8, bool) {
        if let Some((name, dots)) = self.note_type() {
            return (name, dots, false);
        }
        // Largest dotted/undotted value not exceeding the duration
        let mut best: Option<(&'static str, u8, Rational32)> = None;
        for (name, base) in NOTE_TYPES {
            for dots in 0u8..=2 {
                let factor = Rational32::new((1i32 << (dots + 1)) - 1, 1 << dots);
                let value = base_value(base) * factor;
                if value <= self.0 {
                    match best {
                        Some((_, _, b)) if b >= value => {}
                        _ => best = Some((name, dots, value)),
                    }
                }
            }
        }
        match best {
            Some((name, dots, _)) => (name, dots, true),
            // Shorter than a 256th: show the smallest type we have
            None => ("256th", 0, true),
        }
    }
}

/// (type name, quarter-note value as (numer, denom)) from longest to shortest
const NOTE_TYPES: [(&str, (i32, i32)); 10] = [
    ("breve", (8, 1)),
    ("whole", (4, 1)),
    ("half", (2, 1)),
    ("quarter", (1, 1)),
    ("eighth", (1, 2)),
    ("16th", (1, 4)),
    ("32nd", (1, 8)),
    ("64th", (1, 16)),
    ("128th", (1, 32)),
    ("256th", (1, 64)),
];

fn base_value(base: (i32, i32)) -> Rational32 {
    Rational32::new(base.0, base.1)
}

/// Reduce an i64 fraction into a `Dur`, rounding to 1/`MAX_DEN` if the
/// reduced form does not fit in i32
fn reduce_i64(n: i64, d: i64) -> (Dur, bool) {
    debug_assert!(d != 0);
    let (n, d) = if d < 0 { (-n, -d) } else { (n, d) };
    let g = gcd_i64(n, d);
    let (rn, rd) = if g > 0 { (n / g, d / g) } else { (n, d) };
    if rn.abs() <= i32::MAX as i64 && rd <= i32::MAX as i64 && rd <= MAX_DEN {
        (Dur(Rational32::new(rn as i32, rd as i32)), false)
    } else {
        // Round to the nearest multiple of 1/MAX_DEN
        let scaled = (rn * MAX_DEN + rd / 2).div_euclid(rd);
        let clamped = scaled.clamp(i32::MIN as i64, i32::MAX as i64);
        (
            Dur(Rational32::new(clamped as i32, MAX_DEN as i32)),
            true,
        )
    }
}

fn gcd_i64(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.abs()
}

// Plain operators for the common in-range case. These still reduce, and
// saturate through the same rounding path as the checked variants.
impl Default for Dur {
    fn default() -> Self {
        Dur::zero()
    }
}

impl Add for Dur {
    type Output = Dur;
    fn add(self, rhs: Dur) -> Dur {
        self.checked_add(rhs).0
    }
}

impl Sub for Dur {
    type Output = Dur;
    fn sub(self, rhs: Dur) -> Dur {
        let neg = Dur(Rational32::new(-rhs.numer(), rhs.denom()));
        self.checked_add(neg).0
    }
}

impl Mul for Dur {
    type Output = Dur;
    fn mul(self, rhs: Dur) -> Dur {
        self.checked_mul(rhs).0
    }
}

impl fmt::Debug for Dur {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numer(), self.denom())
    }
}

impl fmt::Display for Dur {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denom() == 1 {
            write!(f, "{}", self.numer())
        } else {
            write!(f, "{}/{}", self.numer(), self.denom())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_terms() {
        let d = Dur::new(2, 8);
        assert_eq!((d.numer(), d.denom()), (1, 4));
    }

    #[test]
    fn test_mul_exact() {
        let (d, rounded) = Dur::new(3, 2).checked_mul(Dur::new(2, 3));
        assert_eq!(d, Dur::from_int(1));
        assert!(!rounded);
    }

    #[test]
    fn test_add_reduces() {
        let (d, rounded) = Dur::new(1, 6).checked_add(Dur::new(1, 3));
        assert_eq!(d, Dur::new(1, 2));
        assert!(!rounded);
    }

    #[test]
    fn test_overflow_rounds() {
        // 1/700 * 1/700 cannot stay under MAX_DEN; must round, not panic.
        // The nearest multiple of 1/768 is zero, which reduces to 0/1.
        let (d, rounded) = Dur::new(1, 700).checked_mul(Dur::new(1, 700));
        assert!(rounded);
        assert!(d.is_zero());
        // A value that rounds to something nonzero keeps the 768 grid
        let (d, rounded) = Dur::new(1, 700).checked_mul(Dur::new(700, 1000));
        assert!(rounded);
        assert_eq!(d, Dur::new(1, MAX_DEN as i32));
    }

    #[test]
    fn test_serde_round_trip() {
        let d = Dur::new(3, 16);
        let json = serde_json::to_string(&d).unwrap();
        let back: Dur = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_note_type_exact() {
        assert_eq!(Dur::from_int(1).note_type(), Some(("quarter", 0)));
        assert_eq!(Dur::new(3, 2).note_type(), Some(("quarter", 1)));
        assert_eq!(Dur::new(7, 4).note_type(), Some(("quarter", 2)));
        assert_eq!(Dur::new(1, 2).note_type(), Some(("eighth", 0)));
        assert_eq!(Dur::from_int(4).note_type(), Some(("whole", 0)));
        assert_eq!(Dur::new(5, 4).note_type(), None);
    }

    #[test]
    fn test_approx_rounds_down() {
        let (name, dots, inexact) = Dur::new(5, 4).approx_note_type();
        assert_eq!((name, dots), ("quarter", 0));
        assert!(inexact);
    }

    #[test]
    fn test_in_divisions() {
        assert_eq!(Dur::new(1, 2).in_divisions(4), 2);
        assert_eq!(Dur::new(3, 16).in_divisions(16), 3);
    }
}
