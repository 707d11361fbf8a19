//! Run-length coding for boolean pixel buffers.
//!
//! The stream is a sequence of one-byte run counts. Runs alternate between
//! background (`false`) and paint (`true`), always starting with background,
//! so a buffer that begins with paint encodes a leading `0`. A run longer than
//! 255 is split into `255, 0, rest`, the `0` being an empty run of the other
//! value.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RleError {
    #[error("run lengths cover {actual} pixels, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Encode pixels in row-major order.
pub fn encode(pixels: &[bool]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut current = false;
    let mut count: u8 = 0;

    for &pixel in pixels {
        if pixel != current {
            out.push(count);
            current = pixel;
            count = 0;
        }
        if count == u8::MAX {
            out.push(u8::MAX);
            out.push(0);
            count = 0;
        }
        count += 1;
    }
    out.push(count);
    out
}

/// Decode a run-length stream into exactly `expected` pixels.
pub fn decode(data: &[u8], expected: usize) -> Result<Vec<bool>, RleError> {
    let actual: usize = data.iter().map(|&c| c as usize).sum();
    if actual != expected {
        return Err(RleError::LengthMismatch { expected, actual });
    }

    let mut pixels = Vec::with_capacity(expected);
    let mut current = false;
    for &count in data {
        pixels.extend(std::iter::repeat_n(current, count as usize));
        current = !current;
    }
    Ok(pixels)
}
