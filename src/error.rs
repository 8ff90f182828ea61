//! Typed error taxonomy for the shareable containers.
//!
//! Every public operation that can fail returns one of these variants —
//! never a bare `std::io::Error` or a panic — so callers can match on the
//! failure kind instead of parsing a message.

use std::fmt;

/// Errors surfaced by [`crate::map::ShareableMap`] and
/// [`crate::array::ShareableArray`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Neither a shared nor a process-local allocation could satisfy a
    /// growth or construction request. Never retried automatically.
    #[error("capacity exhausted: requested {requested} bytes, region reservation is {reserved} bytes")]
    CapacityExhausted { requested: usize, reserved: usize },

    /// A lock could not be acquired within the configured timeout.
    #[error("timed out after {0:?} waiting to acquire the lock")]
    LockTimeout(std::time::Duration),

    /// `TransferableState` was reconstructed with a `kind` that does not
    /// match the container being built from it.
    #[error("invalid handoff: expected region kind {expected:?}, found {found:?}")]
    InvalidHandoff {
        expected: crate::envelope::RegionKind,
        found: crate::envelope::RegionKind,
    },

    /// A region adopted from a `TransferableState` failed structural
    /// validation (bad length, zero bucket/slot count, corrupt offsets).
    #[error("invalid region layout: {0}")]
    InvalidLayout(&'static str),

    /// Construction-time configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    /// A reducing operation (`reduce`/`reduce_right`) was invoked on an
    /// empty collection without an initial accumulator.
    #[error("reduce of empty collection with no initial value")]
    EmptyReduce,

    /// An encoder failed to encode or decode a value; the inner error is
    /// surfaced unchanged.
    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

/// Error returned by a [`crate::encoder::ValueEncoder`] implementation.
#[derive(Debug)]
pub struct EncoderError(pub Box<dyn std::error::Error + Send + Sync + 'static>);

impl fmt::Display for EncoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "encoder error: {}", self.0)
    }
}

impl std::error::Error for EncoderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

impl EncoderError {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        EncoderError(Box::new(err))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        #[derive(Debug)]
        struct Msg(String);
        impl fmt::Display for Msg {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
        impl std::error::Error for Msg {}
        EncoderError(Box::new(Msg(message.into())))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
