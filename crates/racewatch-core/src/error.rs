//! Internal error taxonomy.
//!
//! `DetectorError` never crosses the detector contract boundary: every
//! public `Engine` method stays infallible from the instrumenter's point of
//! view. Variants exist so that logging and the `finalize` summary can
//! categorize what went wrong internally.

use thiserror::Error;

/// Usage / Resource / Protocol / the taxonomy has no Fatal variant because
/// the detector must never abort the host application.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// A caller-side protocol violation: release without a matching
    /// acquire, join of an unknown child, double deallocate. Logged at
    /// warn; the offending event is dropped, everything else continues.
    #[error("usage error: {0}")]
    Usage(String),

    /// An internal resource was unavailable: shadow allocation failure, a
    /// sink write error. Logged at error; the specific event is dropped.
    #[error("resource error: {0}")]
    Resource(String),

    /// The managed-code symbol resolver misbehaved: timeout or malformed
    /// reply. The resolver connection is reset and symbolization falls
    /// back to the raw program counter for that module.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DetectorError {
    pub fn usage(msg: impl Into<String>) -> Self {
        DetectorError::Usage(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        DetectorError::Resource(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        DetectorError::Protocol(msg.into())
    }

    /// Log this error at the severity its taxonomy class calls for.
    pub fn log(&self) {
        match self {
            DetectorError::Usage(msg) => log::warn!("{msg}"),
            DetectorError::Resource(msg) => log::error!("{msg}"),
            DetectorError::Protocol(msg) => log::warn!("{msg}"),
        }
    }
}
