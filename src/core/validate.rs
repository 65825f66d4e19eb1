//! Race-tolerant validation of expected reads.
//!
//! Every "expect" read in [`crate::core::wire`] funnels a mismatch through a
//! [`MismatchHandler`]. The default [`Strict`] handler fails on everything.
//! [`RaceTolerant`] absorbs mismatch shapes a call site knows to be a benign
//! crossing of two in-flight writes, while keeping at most one diagnostic
//! pending at a time.

use crate::error::{constants, ProtocolError, Result};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Strategy invoked when a read does not match what the protocol expects.
pub trait MismatchHandler: Send + Sync {
    /// The stream ended early. Returns the error to raise; a handler may
    /// decorate it but can never turn it into a value.
    fn end_of_stream(&self, missing: usize) -> ProtocolError {
        ProtocolError::UnexpectedEof { missing }
    }

    /// `actual` was read where exactly `expected` was required.
    fn mismatch(&self, expected: i64, actual: i64) -> Result<i64>;

    /// `actual` was read where one of `expected` was required.
    fn mismatch_any(&self, expected: &[i64], actual: i64) -> Result<i64>;

    /// `written` was sent, then `actual` arrived instead of the acknowledgement `expected`.
    fn write_read_race(&self, written: i64, expected: i64, actual: i64) -> Result<i64>;
}

/// Fails on every mismatch.
#[derive(Debug, Default, Clone, Copy)]
pub struct Strict;

/// Shared strict handler used when a call site does not supply its own.
pub static STRICT: Strict = Strict;

impl MismatchHandler for Strict {
    fn mismatch(&self, expected: i64, actual: i64) -> Result<i64> {
        Err(ProtocolError::Mismatch {
            actual,
            expected: vec![expected],
        })
    }

    fn mismatch_any(&self, expected: &[i64], actual: i64) -> Result<i64> {
        Err(ProtocolError::Mismatch {
            actual,
            expected: expected.to_vec(),
        })
    }

    fn write_read_race(&self, written: i64, expected: i64, actual: i64) -> Result<i64> {
        Err(ProtocolError::Corrupted(format!(
            "wrote {written}, expected acknowledgement {expected}, read {actual}"
        )))
    }
}

/// Absorbs registered `(expected, actual)` shapes once, escalating a second
/// inconsistency that arrives before the first was settled.
#[derive(Debug, Default)]
pub struct RaceTolerant {
    benign: Vec<(i64, i64)>,
    pending: Mutex<Option<String>>,
}

impl RaceTolerant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat reading `actual` where `expected` was due as a benign race.
    pub fn allow(mut self, expected: i64, actual: i64) -> Self {
        self.benign.push((expected, actual));
        self
    }

    /// The diagnostic of the race currently being reconciled, if any.
    pub fn pending(&self) -> Option<String> {
        self.pending.lock().ok().and_then(|slot| slot.clone())
    }

    /// Mark the pending race as reconciled.
    pub fn settle(&self) {
        if let Ok(mut slot) = self.pending.lock() {
            if let Some(message) = slot.take() {
                debug!(%message, "Race settled");
            }
        }
    }

    fn is_benign(&self, expected: &[i64], actual: i64) -> bool {
        self.benign
            .iter()
            .any(|(e, a)| *a == actual && expected.contains(e))
    }

    fn handle(&self, expected: &[i64], actual: i64, message: String) -> Result<i64> {
        let mut slot = self
            .pending
            .lock()
            .map_err(|_| ProtocolError::Corrupted(constants::ERR_LOCK_POISONED.into()))?;

        if let Some(first) = slot.take() {
            warn!(%first, second = %message, "Inconsistency while reconciling a race");
            return Err(ProtocolError::Corrupted(format!("{first}; then {message}")));
        }

        if self.is_benign(expected, actual) {
            debug!(%message, "Absorbing benign race");
            *slot = Some(message);
            Ok(actual)
        } else {
            Err(ProtocolError::Corrupted(message))
        }
    }
}

impl MismatchHandler for RaceTolerant {
    fn end_of_stream(&self, missing: usize) -> ProtocolError {
        match self.pending.lock().ok().and_then(|mut slot| slot.take()) {
            Some(first) => ProtocolError::Corrupted(format!(
                "{first}; then stream ended with {missing} bytes missing"
            )),
            None => ProtocolError::UnexpectedEof { missing },
        }
    }

    fn mismatch(&self, expected: i64, actual: i64) -> Result<i64> {
        self.handle(
            &[expected],
            actual,
            format!("read {actual}, expected {expected}"),
        )
    }

    fn mismatch_any(&self, expected: &[i64], actual: i64) -> Result<i64> {
        self.handle(
            expected,
            actual,
            format!("read {actual}, expected one of {expected:?}"),
        )
    }

    fn write_read_race(&self, written: i64, expected: i64, actual: i64) -> Result<i64> {
        self.handle(
            &[expected],
            actual,
            format!("wrote {written}, expected acknowledgement {expected}, read {actual}"),
        )
    }
}
