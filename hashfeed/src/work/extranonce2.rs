//! Extranonce2 counters for stratum coinbase rolling.
//!
//! A stratum pool assigns each session a fixed width for extranonce2. Every
//! distinct value gives a distinct coinbase, and so a distinct merkle root,
//! which is how one notified job becomes many units of work.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Extranonce2Error {
    #[error("Invalid extranonce2 size: {0} (must be 1-8 bytes)")]
    InvalidSize(usize),

    #[error("Value {0} exceeds maximum for size {1} bytes")]
    ValueTooLarge(u64, usize),
}

/// One extranonce2 value, serialized little-endian in `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce2 {
    value: u64,
    size: u8,
}

impl Extranonce2 {
    pub fn new(value: u64, size: usize) -> Result<Self, Extranonce2Error> {
        let size = check_size(size)?;
        if value > max_for_size(size) {
            return Err(Extranonce2Error::ValueTooLarge(value, size as usize));
        }
        Ok(Self { value, size })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.value.to_le_bytes()[..self.size as usize].to_vec()
    }
}

impl fmt::Display for Extranonce2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

fn check_size(size: usize) -> Result<u8, Extranonce2Error> {
    match u8::try_from(size) {
        Ok(s @ 1..=8) => Ok(s),
        _ => Err(Extranonce2Error::InvalidSize(size)),
    }
}

fn max_for_size(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// Per-session extranonce2 allocator.
///
/// Hands out each value in `[0, max]` once. A new session (new nonce1)
/// gets a fresh counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extranonce2Counter {
    next: u64,
    max: u64,
    size: u8,
    exhausted: bool,
}

impl Extranonce2Counter {
    pub fn new(size: usize) -> Result<Self, Extranonce2Error> {
        let size = check_size(size)?;
        Ok(Self {
            next: 0,
            max: max_for_size(size),
            size,
            exhausted: false,
        })
    }

    /// Take the next unused value, or `None` once the space is used up.
    pub fn allocate(&mut self) -> Option<Extranonce2> {
        if self.exhausted {
            return None;
        }
        let value = self.next;
        if value == self.max {
            self.exhausted = true;
        } else {
            self.next += 1;
        }
        Some(Extranonce2 {
            value,
            size: self.size,
        })
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Values handed out so far.
    pub fn allocated(&self) -> u64 {
        if self.exhausted {
            self.max.saturating_add(1)
        } else {
            self.next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extranonce2_bytes_and_display() {
        let ext = Extranonce2::new(0x1234, 4).unwrap();
        assert_eq!(ext.to_bytes(), vec![0x34, 0x12, 0, 0]);
        assert_eq!(ext.to_string(), "34120000");
    }

    #[test]
    fn test_extranonce2_errors() {
        assert_eq!(
            Extranonce2::new(0, 0),
            Err(Extranonce2Error::InvalidSize(0))
        );
        assert_eq!(
            Extranonce2::new(0, 9),
            Err(Extranonce2Error::InvalidSize(9))
        );
        assert_eq!(
            Extranonce2::new(0x100, 1),
            Err(Extranonce2Error::ValueTooLarge(0x100, 1))
        );
    }

    #[test]
    fn test_counter_allocates_each_value_once() {
        let mut counter = Extranonce2Counter::new(1).unwrap();
        let mut seen = Vec::new();
        while let Some(ext) = counter.allocate() {
            seen.push(ext.value());
        }
        assert_eq!(seen.len(), 256);
        assert_eq!(seen[0], 0);
        assert_eq!(seen[255], 255);
        assert_eq!(counter.allocated(), 256);
        assert!(counter.allocate().is_none());
    }

    #[test]
    fn test_full_width_counter() {
        let mut counter = Extranonce2Counter::new(8).unwrap();
        assert_eq!(counter.allocate().unwrap().value(), 0);
        assert_eq!(counter.allocate().unwrap().value(), 1);
        assert_eq!(counter.size(), 8);
    }
}
