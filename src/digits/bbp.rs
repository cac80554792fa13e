//! Bailey–Borwein–Plouffe hex digit extraction
//!
//! For a position `d` (0 = first hex digit after the point):
//!
//! ```text
//! frac(16^d · π) = 4·S(1) − 2·S(4) − S(5) − S(6)
//!
//! S(j) = Σ_{k ≤ d} (16^(d−k) mod (8k+j)) / (8k+j)  +  Σ_{k > d} 16^(d−k) / (8k+j)
//! ```
//!
//! Fractions are kept as 128-bit fixed point (`value / 2^128`) and every sum
//! wraps modulo 1, so the arithmetic is exact integer work and the output is
//! identical on every platform. Each head term is truncated by less than
//! `2^-128`; the upper 64 bits (16 hex digits) of one evaluation are therefore
//! trusted for every offset below [`MAX_OFFSET`].

use crate::error::{Error, Result};
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

/// Minimum unit of work: block lengths below this many bytes are rejected and
/// the scheduler cursor advances by this many characters per offset.
pub const NATIVE_CHUNK_CHARS: u64 = 10;

/// Hex digits taken from a single series evaluation
const DIGITS_PER_EVAL: u64 = 16;

/// Head terms evaluated between two cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Largest end offset (exclusive) the generator accepts. The tail of the
/// series runs up to 32 terms past the last position and every modulus
/// `8k + 6` must fit in a `u64`.
pub const MAX_OFFSET: u64 = (u64::MAX - 6) / 8 - 64;

/// Generate `count` packed bytes (`2 * count` hex digits) starting at `offset`.
///
/// The high nibble of each byte is the digit at the lower offset.
pub fn generate(offset: u64, count: usize) -> Result<Vec<u8>> {
    generate_inner(offset, count, None)
}

/// Like [`generate`], but aborts with [`Error::Cancelled`] once `cancel` is set.
///
/// The token is observed at every 16-digit evaluation and periodically inside
/// long series.
pub fn generate_with(offset: u64, count: usize, cancel: &CancellationToken) -> Result<Vec<u8>> {
    generate_inner(offset, count, Some(cancel))
}

/// Upper-case hex digit string of `count` digits starting at `offset`
pub fn hex_digits(offset: u64, count: usize) -> Result<String> {
    let bytes = generate(offset, count.div_ceil(2))?;
    let mut digits = hex::encode_upper(bytes);
    digits.truncate(count);
    Ok(digits)
}

fn generate_inner(offset: u64, count: usize, cancel: Option<&CancellationToken>) -> Result<Vec<u8>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let digits = (count as u64)
        .checked_mul(2)
        .ok_or_else(|| Error::InvalidArgument(format!("byte count {} too large", count)))?;
    offset
        .checked_add(digits)
        .filter(|&end| end <= MAX_OFFSET)
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "offset {} + {} digits exceeds supported range ({})",
                offset, digits, MAX_OFFSET
            ))
        })?;

    let evaluations = digits.div_ceil(DIGITS_PER_EVAL);
    let words = (0..evaluations)
        .into_par_iter()
        .map(|i| fraction_word(offset + i * DIGITS_PER_EVAL, cancel))
        .collect::<Result<Vec<u64>>>()?;

    let bytes = (0..count as u64)
        .map(|pair| (nibble(&words, pair * 2) << 4) | nibble(&words, pair * 2 + 1))
        .collect();
    Ok(bytes)
}

fn nibble(words: &[u64], index: u64) -> u8 {
    let word = words[(index / DIGITS_PER_EVAL) as usize];
    let shift = 60 - 4 * (index % DIGITS_PER_EVAL);
    ((word >> shift) & 0xF) as u8
}

/// The 16 hex digits starting at position `d`, most significant first
fn fraction_word(d: u64, cancel: Option<&CancellationToken>) -> Result<u64> {
    let s1 = series(1, d, cancel)?;
    let s4 = series(4, d, cancel)?;
    let s5 = series(5, d, cancel)?;
    let s6 = series(6, d, cancel)?;

    let x = s1
        .wrapping_mul(4)
        .wrapping_sub(s4.wrapping_mul(2))
        .wrapping_sub(s5)
        .wrapping_sub(s6);
    Ok((x >> 64) as u64)
}

fn series(j: u64, d: u64, cancel: Option<&CancellationToken>) -> Result<u128> {
    let mut sum: u128 = 0;

    for k in 0..=d {
        if k % CANCEL_CHECK_INTERVAL == 0 {
            check_cancelled(cancel)?;
        }
        let m = 8 * k + j;
        sum = sum.wrapping_add(fixed_ratio(pow16_mod(d - k, m), m));
    }

    // Tail: 16^-(k-d) / m until the term drops below one ulp
    let mut k = d + 1;
    loop {
        let shift = 4 * (k - d);
        if shift >= 128 {
            break;
        }
        let term = (1u128 << (128 - shift)) / (8 * k + j) as u128;
        if term == 0 {
            break;
        }
        sum = sum.wrapping_add(term);
        k += 1;
    }

    Ok(sum)
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(Error::Cancelled),
        _ => Ok(()),
    }
}

/// `floor(r / m * 2^128)` for `r < m`, by two-step long division
fn fixed_ratio(r: u64, m: u64) -> u128 {
    let m = m as u128;
    let numerator = (r as u128) << 64;
    let high = numerator / m;
    let rem = numerator % m;
    let low = (rem << 64) / m;
    (high << 64) | low
}

/// `16^exp mod m` with 128-bit intermediates
fn pow16_mod(mut exp: u64, m: u64) -> u64 {
    if m == 1 {
        return 0;
    }
    let m = m as u128;
    let mut base = 16 % m;
    let mut acc: u128 = 1;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc * base % m;
        }
        base = base * base % m;
        exp >>= 1;
    }
    acc as u64
}
