//! Value types shared across the crate.

mod debounced_alarm;
mod difficulty;

pub use bitcoin::pow::{CompactTarget, Target};
pub use debounced_alarm::{AlarmStatus, DebouncedAlarm};
pub use difficulty::Difficulty;

use std::fmt;

use crate::u256::U256;

impl From<Target> for U256 {
    fn from(target: Target) -> Self {
        Self::from_le_bytes(target.to_le_bytes())
    }
}

impl From<U256> for Target {
    fn from(u: U256) -> Self {
        Target::from_le_bytes(u.to_le_bytes())
    }
}

/// Hashes per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct HashRate(pub f64);

impl HashRate {
    /// Expected network hashrate for a difficulty and block interval.
    ///
    /// Each unit of difficulty takes 2^32 hashes on average.
    pub fn from_network_difficulty(difficulty: f64, block_interval_secs: f64) -> Self {
        if block_interval_secs <= 0.0 {
            return Self(0.0);
        }
        Self(difficulty * 4_294_967_296.0 / block_interval_secs)
    }

    pub fn to_human_readable(&self) -> String {
        const UNITS: [(f64, &str); 6] = [
            (1e21, "ZH/s"),
            (1e18, "EH/s"),
            (1e15, "PH/s"),
            (1e12, "TH/s"),
            (1e9, "GH/s"),
            (1e6, "MH/s"),
        ];
        for (scale, unit) in UNITS {
            if self.0 >= scale {
                return format!("{:.2} {}", self.0 / scale, unit);
            }
        }
        format!("{:.0} H/s", self.0)
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_human_readable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashrate_from_network_difficulty() {
        // Difficulty 1 at one block per 600s is about 7.16 MH/s
        let rate = HashRate::from_network_difficulty(1.0, 600.0);
        assert!((rate.0 - 7_158_278.826).abs() < 1.0, "rate={}", rate.0);
        assert_eq!(rate.to_human_readable(), "7.16 MH/s");
    }

    #[test]
    fn test_hashrate_units() {
        assert_eq!(HashRate(950.0).to_string(), "950 H/s");
        assert_eq!(HashRate(1.5e12).to_string(), "1.50 TH/s");
        assert_eq!(HashRate(6.2e20).to_string(), "620.00 EH/s");
    }

    #[test]
    fn test_target_u256_conversion() {
        let u = U256::from(Target::MAX);
        assert_eq!(Target::from(u), Target::MAX);
    }
}
