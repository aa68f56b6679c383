//! Share and network difficulty.

use std::cmp::Ordering;
use std::fmt;

use bitcoin::pow::Target;

use crate::u256::U256;

/// Fixed-point scale for fractional difficulties.
const FRACTION_SCALE: f64 = 65536.0;

/// Mining difficulty, stored as its target.
///
/// Difficulty and target are inverses against the difficulty-1 target
/// (`Target::MAX`): `target = MAX / difficulty`. Pools speak difficulty as
/// floats (stratum `set_difficulty`, GBT), devices and share checks need
/// targets, so the target is the source of truth and the float is derived.
#[derive(Debug, Clone, Copy)]
pub struct Difficulty(Target);

impl Difficulty {
    /// Target of zero; nothing satisfies it.
    pub const MAX: Self = Self(Target::ZERO);

    /// Difficulty 1.
    pub const ONE: Self = Self(Target::MAX);

    /// Convert from a float difficulty.
    ///
    /// Fractional values keep 16 bits of precision. Non-positive and
    /// non-finite input maps to the easiest possible target.
    pub fn from_f64(value: f64) -> Self {
        if value <= 0.0 || !value.is_finite() {
            return Self(Target::from(U256::MAX));
        }

        let max_target = U256::from(Target::MAX);
        if value >= (1u64 << 32) as f64 {
            return Self(Target::from(max_target / value as u64));
        }

        let scaled = (value * FRACTION_SCALE).round() as u64;
        if scaled == 0 {
            return Self(Target::from(U256::MAX));
        }
        let target = max_target.saturating_mul_u64(FRACTION_SCALE as u64) / scaled;
        Self(Target::from(target))
    }

    pub fn as_f64(self) -> f64 {
        if self.0 == Target::ZERO {
            return f64::INFINITY;
        }
        self.0.difficulty_float()
    }

    pub fn from_target(target: Target) -> Self {
        Self(target)
    }

    pub fn to_target(self) -> Target {
        self.0
    }

    /// Difficulty a hash achieves. Takes the hash in internal (little-endian)
    /// byte order, as produced by sha256d over a serialized header.
    pub fn from_hash(hash: &[u8; 32]) -> Self {
        Self(Target::from_le_bytes(*hash))
    }
}

impl From<u64> for Difficulty {
    fn from(diff: u64) -> Self {
        if diff == 0 {
            return Self(Target::MAX);
        }
        Self(Target::from(U256::from(Target::MAX) / diff))
    }
}

impl PartialEq for Difficulty {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Difficulty {}

impl PartialOrd for Difficulty {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Difficulty {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smaller target is higher difficulty
        other.0.cmp(&self.0)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_si(self.as_f64(), f)
    }
}

/// Format a float with an SI suffix, trimming decimals for large values.
pub(crate) fn format_si(value: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !value.is_finite() {
        return write!(f, "inf");
    }
    if value < 1.0 {
        let s = format!("{:.6}", value);
        return write!(f, "{}", s.trim_end_matches('0').trim_end_matches('.'));
    }

    const SUFFIXES: [(f64, &str); 6] = [
        (1e18, "E"),
        (1e15, "P"),
        (1e12, "T"),
        (1e9, "G"),
        (1e6, "M"),
        (1e3, "K"),
    ];
    let (scaled, suffix) = SUFFIXES
        .iter()
        .find(|(scale, _)| value >= *scale)
        .map(|(scale, suffix)| (value / scale, *suffix))
        .unwrap_or((value, ""));

    if scaled >= 100.0 || scaled.fract() == 0.0 {
        write!(f, "{:.0}{}", scaled, suffix)
    } else if scaled >= 10.0 {
        write!(f, "{:.1}{}", scaled, suffix)
    } else {
        write!(f, "{:.2}{}", scaled, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_integer_difficulty_target() {
        assert_eq!(Difficulty::from(1_u64).to_target(), Target::MAX);
        assert_eq!(Difficulty::from(0_u64).to_target(), Target::MAX);
        assert!(Difficulty::from(1000_u64).to_target() < Difficulty::from(100_u64).to_target());
    }

    #[test_case(1.0; "one")]
    #[test_case(0.5; "half")]
    #[test_case(1.5; "fractional")]
    #[test_case(4096.0; "integer")]
    #[test_case(1e12; "large")]
    fn test_from_f64_recovers_value(value: f64) {
        let recovered = Difficulty::from_f64(value).as_f64();
        assert!(
            (recovered - value).abs() / value < 1e-4,
            "value={value} recovered={recovered}"
        );
    }

    #[test]
    fn test_from_f64_degenerate() {
        let easiest = Difficulty::from_f64(0.0).to_target();
        assert!(easiest > Target::MAX);
        assert_eq!(Difficulty::from_f64(f64::NAN).to_target(), easiest);
    }

    #[test]
    fn test_from_hash() {
        let diff = Difficulty::from_hash(&Target::MAX.to_le_bytes());
        assert!((diff.as_f64() - 1.0).abs() < 0.001);

        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        assert!(Difficulty::from_hash(&bytes).as_f64() > 1e60);

        assert_eq!(Difficulty::from_hash(&[0u8; 32]), Difficulty::MAX);
        assert!(Difficulty::MAX.as_f64().is_infinite());
    }

    #[test]
    fn test_ordering() {
        assert!(Difficulty::from(1000_u64) > Difficulty::from(100_u64));
        assert_eq!(Difficulty::from(500_u64), Difficulty::from(500_u64));
    }

    #[test]
    fn test_display() {
        assert_eq!(Difficulty::from(112_700_000_000_000_u64).to_string(), "113T");
        assert_eq!(Difficulty::from(1_500_000_u64).to_string(), "1.50M");
        assert_eq!(Difficulty::from(1_u64).to_string(), "1");
        assert_eq!(Difficulty::from_f64(0.5).to_string(), "0.5");
    }
}
