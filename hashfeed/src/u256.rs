//! 256-bit unsigned integer used for target arithmetic.
//!
//! Thin wrapper over `ruint` so callers never name the backing library.

use std::ops::{Div, Mul};

use ruint::aliases::U256 as Ruint256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct U256(Ruint256);

impl U256 {
    pub const ZERO: Self = Self(Ruint256::ZERO);
    pub const MAX: Self = Self(Ruint256::MAX);

    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_le_bytes(bytes))
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_be_bytes(bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Multiply, saturating at [`U256::MAX`] instead of wrapping.
    pub fn saturating_mul_u64(self, rhs: u64) -> Self {
        Self(self.0.saturating_mul(Ruint256::from(rhs)))
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self(Ruint256::from(value))
    }
}

impl Div for U256 {
    type Output = Self;

    fn div(self, rhs: Self) -> Self::Output {
        Self(self.0 / rhs.0)
    }
}

impl Div<u64> for U256 {
    type Output = Self;

    fn div(self, rhs: u64) -> Self::Output {
        Self(self.0 / Ruint256::from(rhs))
    }
}

impl Mul<u64> for U256 {
    type Output = Self;

    fn mul(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_mul(Ruint256::from(rhs)))
    }
}
