//! # Word order and numeric encodings
//!
//! Registers are 16-bit words. Wider values span several consecutive
//! registers and devices disagree on which word comes first.
//!
//! - **High word first** (`ABCD`): `0x12345678` is stored as `[0x1234, 0x5678]`
//! - **Low word first** (`CDAB`): `0x12345678` is stored as `[0x5678, 0x1234]`
//!
//! Also provides two's complement conversion of arbitrary width and the IEEE
//! 754 bit patterns used to carry floats in registers.

use std::fmt;

use crate::error::{ModbusError, ModbusResult};

/// Order of 16-bit words inside a 32/64-bit value
///
/// # Example
///
/// ```rust
/// use voltage_modbus_tcp::WordOrder;
///
/// let order = WordOrder::from_str("CDAB").unwrap();
/// assert_eq!(order, WordOrder::LowWordFirst);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WordOrder {
    /// Most significant word first (ABCD)
    #[default]
    HighWordFirst,
    /// Least significant word first (CDAB)
    LowWordFirst,
}

impl WordOrder {
    /// Parse common notations ("ABCD", "big_endian", "CDAB", "little").
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "ABCD" | "BE" | "BIG" | "BIGENDIAN" | "HIGHWORDFIRST" => Some(Self::HighWordFirst),
            "CDAB" | "LE" | "LITTLE" | "LITTLEENDIAN" | "LOWWORDFIRST" => Some(Self::LowWordFirst),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighWordFirst => "ABCD (high word first)",
            Self::LowWordFirst => "CDAB (low word first)",
        }
    }
}

impl fmt::Display for WordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Word list <-> long list
// ============================================================================

fn words_to_wide(words: &[u16], width: usize, order: WordOrder) -> Vec<u64> {
    words
        .chunks_exact(width)
        .map(|chunk| {
            let fold = |acc: u64, w: &u16| (acc << 16) | u64::from(*w);
            match order {
                WordOrder::HighWordFirst => chunk.iter().fold(0, fold),
                WordOrder::LowWordFirst => chunk.iter().rev().fold(0, fold),
            }
        })
        .collect()
}

fn wide_to_words(values: &[u64], width: usize, order: WordOrder) -> Vec<u16> {
    let mut words = Vec::with_capacity(values.len() * width);
    for &value in values {
        let mut block: Vec<u16> = (0..width).map(|i| (value >> (16 * i)) as u16).collect();
        if order == WordOrder::HighWordFirst {
            block.reverse();
        }
        words.extend(block);
    }
    words
}

/// Combine pairs of registers into 32-bit values.
///
/// A trailing odd register is ignored.
pub fn words_to_longs(words: &[u16], order: WordOrder) -> Vec<u32> {
    words_to_wide(words, 2, order)
        .into_iter()
        .map(|v| v as u32)
        .collect()
}

/// Split 32-bit values into register pairs
pub fn longs_to_words(values: &[u32], order: WordOrder) -> Vec<u16> {
    let wide: Vec<u64> = values.iter().map(|&v| u64::from(v)).collect();
    wide_to_words(&wide, 2, order)
}

/// Combine groups of four registers into 64-bit values.
///
/// Trailing registers that do not fill a group are ignored.
pub fn words_to_long_longs(words: &[u16], order: WordOrder) -> Vec<u64> {
    words_to_wide(words, 4, order)
}

/// Split 64-bit values into groups of four registers
pub fn long_longs_to_words(values: &[u64], order: WordOrder) -> Vec<u16> {
    wide_to_words(values, 4, order)
}

// ============================================================================
// Two's complement
// ============================================================================

/// Two's complement conversion on `bit_size` bits (1-62).
///
/// A negative input yields its unsigned encoding, an unsigned input with the
/// sign bit set yields the negative value, anything else passes through.
/// Values that do not fit in `bit_size` bits are rejected.
pub fn twos_complement(value: i64, bit_size: u32) -> ModbusResult<i64> {
    if bit_size == 0 || bit_size > 62 {
        return Err(ModbusError::invalid_data(format!(
            "unsupported bit size {bit_size}"
        )));
    }
    let min = -(1i64 << (bit_size - 1));
    let max = 1i64 << bit_size;
    if value < min || value >= max {
        return Err(ModbusError::invalid_data(format!(
            "could not compute two's complement for {value} on {bit_size} bits"
        )));
    }
    if value < 0 {
        Ok(value + max)
    } else if value & (1i64 << (bit_size - 1)) != 0 {
        Ok(value - max)
    } else {
        Ok(value)
    }
}

/// Apply [`twos_complement`] to every element
pub fn twos_complement_list(values: &[i64], bit_size: u32) -> ModbusResult<Vec<i64>> {
    values
        .iter()
        .map(|&v| twos_complement(v, bit_size))
        .collect()
}

// ============================================================================
// IEEE 754
// ============================================================================

#[inline]
pub fn decode_ieee_f32(bits: u32) -> f32 {
    f32::from_bits(bits)
}

#[inline]
pub fn encode_ieee_f32(value: f32) -> u32 {
    value.to_bits()
}

#[inline]
pub fn decode_ieee_f64(bits: u64) -> f64 {
    f64::from_bits(bits)
}

#[inline]
pub fn encode_ieee_f64(value: f64) -> u64 {
    value.to_bits()
}

/// Read an f32 stored in two registers
#[inline]
pub fn regs_to_f32(regs: &[u16; 2], order: WordOrder) -> f32 {
    decode_ieee_f32(words_to_longs(regs, order)[0])
}

/// Encode an f32 as two registers
#[inline]
pub fn f32_to_regs(value: f32, order: WordOrder) -> [u16; 2] {
    let words = longs_to_words(&[encode_ieee_f32(value)], order);
    [words[0], words[1]]
}

/// Read an f64 stored in four registers
#[inline]
pub fn regs_to_f64(regs: &[u16; 4], order: WordOrder) -> f64 {
    decode_ieee_f64(words_to_long_longs(regs, order)[0])
}

/// Encode an f64 as four registers
#[inline]
pub fn f64_to_regs(value: f64, order: WordOrder) -> [u16; 4] {
    let words = long_longs_to_words(&[encode_ieee_f64(value)], order);
    [words[0], words[1], words[2], words[3]]
}
