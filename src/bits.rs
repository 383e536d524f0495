//! Bit packing helpers
//!
//! Coil and discrete-input payloads pack bits LSB first: bit `i` of the sequence
//! lands in byte `i / 8`, bit position `i % 8`.

/// Number of bytes needed to hold `bit_count` bits
#[inline]
pub fn byte_length(bit_count: usize) -> usize {
    bit_count.div_ceil(8)
}

/// Pack bits into bytes, LSB first
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; byte_length(bits.len())];
    for (i, _) in bits.iter().enumerate().filter(|(_, &bit)| bit) {
        bytes[i / 8] |= 1 << (i % 8);
    }
    bytes
}

/// Unpack the first `count` bits of `bytes`.
///
/// Bits past the end of `bytes` read as `false`; callers check the byte count
/// before unpacking.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|byte| byte & (1 << (i % 8)) != 0)
                .unwrap_or(false)
        })
        .collect()
}

/// Bits of `value`, least significant first
pub fn word_to_bits(value: u64, bit_size: u32) -> Vec<bool> {
    (0..bit_size.min(64)).map(|i| test_bit(value, i)).collect()
}

#[inline]
pub fn test_bit(value: u64, offset: u32) -> bool {
    value & (1u64 << offset) != 0
}

#[inline]
pub fn set_bit(value: u64, offset: u32) -> u64 {
    value | (1u64 << offset)
}

#[inline]
pub fn reset_bit(value: u64, offset: u32) -> u64 {
    value & !(1u64 << offset)
}

#[inline]
pub fn toggle_bit(value: u64, offset: u32) -> u64 {
    value ^ (1u64 << offset)
}
