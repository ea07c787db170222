//! Q16.16 fixed-point format consumed by the L2 engine.
//!
//! The datapath has no floating-point unit, so corpus and query samples are
//! converted on the host from IEEE-754 binary32 to signed Q16.16 by pure
//! integer manipulation of the bit pattern:
//!
//! ```text
//! sign     = bit 31
//! exponent = bits 30..23 - 127
//! mantissa = bits 22..0 | 0x80_0000        (implicit leading one)
//! shift    = exponent + 16 - 23
//! q16      = ±(mantissa << shift)   or   ±(mantissa >> -shift)
//! ```
//!
//! A biased exponent of zero (zero or subnormal) yields 0. Right shifts
//! truncate toward zero, so the result is within one Q16.16 unit of the
//! input for every finite magnitude below 32768.
//!
//! There is no overflow, NaN or infinity handling. Inputs are expected to be
//! small non-negative magnitudes (SIFT-style pixel counts). Magnitudes that do
//! not fit wrap to the low 32 bits of the shifted mantissa, shifts of 32 or
//! more in either direction yield 0.

/// Fractional bits.
pub const FRAC_BITS: i32 = 16;

/// 1.0 in Q16.16.
pub const ONE: i32 = 1 << FRAC_BITS;

/// Bytes per sample, both before and after conversion.
pub const SAMPLE_BYTES: usize = 4;

const SIGN_BIT: u32 = 0x8000_0000;
const EXPONENT_BIAS: i32 = 127;
const MANTISSA_BITS: i32 = 23;
const MANTISSA_MASK: u32 = 0x007F_FFFF;
const IMPLICIT_ONE: u32 = 0x0080_0000;

/// Convert one binary32 bit pattern to Q16.16.
#[must_use]
pub const fn q16_from_bits(bits: u32) -> i32 {
    let biased = ((bits >> MANTISSA_BITS) & 0xFF) as i32;
    if biased == 0 {
        return 0;
    }

    let mantissa = (bits & MANTISSA_MASK) | IMPLICIT_ONE;
    let shift = biased - EXPONENT_BIAS + FRAC_BITS - MANTISSA_BITS;

    let magnitude = if shift >= 32 || shift <= -32 {
        0
    } else if shift >= 0 {
        mantissa << shift
    } else {
        mantissa >> -shift
    };

    #[allow(clippy::cast_possible_wrap)]
    let value = magnitude as i32;
    if bits & SIGN_BIT != 0 {
        value.wrapping_neg()
    } else {
        value
    }
}

/// Convert an `f32` to Q16.16 through its bit pattern.
#[must_use]
pub fn q16_from_f32(x: f32) -> i32 {
    q16_from_bits(x.to_bits())
}

/// Convert a little-endian binary32 byte stream to little-endian Q16.16 in place.
///
/// Returns the number of samples converted. A trailing partial sample
/// (fewer than four bytes) is left untouched.
pub fn convert_in_place(buf: &mut [u8]) -> usize {
    let mut n = 0;
    for word in buf.chunks_exact_mut(SAMPLE_BYTES) {
        let bits = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        word.copy_from_slice(&q16_from_bits(bits).to_le_bytes());
        n += 1;
    }
    n
}

/// Convert `src` into `dst`, sample for sample.
///
/// Both slices must have the same length; extra bytes in the longer one are
/// ignored. Returns the number of samples converted.
pub fn convert_into(src: &[u8], dst: &mut [u8]) -> usize {
    let mut n = 0;
    for (s, d) in src
        .chunks_exact(SAMPLE_BYTES)
        .zip(dst.chunks_exact_mut(SAMPLE_BYTES))
    {
        let bits = u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
        d.copy_from_slice(&q16_from_bits(bits).to_le_bytes());
        n += 1;
    }
    n
}

/// Q16.16 back to `f32`, for host-side checks and diagnostics.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn q16_to_f32(q: i32) -> f32 {
    q as f32 / ONE as f32
}
