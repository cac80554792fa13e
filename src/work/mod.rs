//! Units of work
//!
//! A [`WorkUnit`] reads one segment of digits from a [`DigitCache`] and
//! derives one SHA-256 per configured block length from it.
//!
//! [`DigitCache`]: crate::digits::DigitCache

pub mod unit;

pub use unit::{BlockHash, UnitOutput, UnitState, WorkUnit};
