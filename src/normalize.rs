//! Carriage-return stripping for bytes that cross the relay boundary.

const CR: u8 = b'\r';

/// Copy `input` with every carriage return removed.
pub fn strip_cr(input: &[u8]) -> Vec<u8> {
    input.iter().copied().filter(|&b| b != CR).collect()
}

/// Remove every carriage return from `buf` without reallocating.
pub fn strip_cr_in_place(buf: &mut Vec<u8>) {
    buf.retain(|&b| b != CR);
}
