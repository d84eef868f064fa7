// Copyright 2025-2026 CEMAXECUTER LLC

use thiserror::Error;

/// Failures reported synchronously by radio session operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RadioError {
    /// The radio hardware could not be acquired.
    #[error("radio device unavailable")]
    DeviceUnavailable,
    /// The receive entry pool could not be sized.
    #[error("receive entry pool does not fit its buffer")]
    OutOfMemory,
    /// Request rejected before touching the radio.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The session is not open.
    #[error("radio session is not open")]
    InvalidState,
}
