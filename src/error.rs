// Interop error taxonomy
//
// Every variant here is fatal for the operation that produced it. The one
// recoverable outcome of the synchronization layer, an acquire timeout, is
// not an error: it is reported as `AcquireStatus::TimedOut`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InteropError {
    /// No adapter offers a device with the queue and interop features we need
    #[error("device creation failed: {0:#}")]
    DeviceCreation(#[source] anyhow::Error),

    /// The device rejected the renderable + shared + keyed-mutex image
    #[error("shared image allocation failed: {0:#}")]
    Allocation(#[source] anyhow::Error),

    /// Stale handle, descriptor mismatch, or no import-capable memory type
    #[error("shared image import failed: {0:#}")]
    Import(#[source] anyhow::Error),

    /// OS-level failure of the synchronization object (device removed, abandoned)
    #[error("keyed mutex failure during {operation}: {reason}")]
    SyncFatal {
        operation: &'static str,
        reason: String,
    },

    /// Acquire/release keys of the two sides do not pair up
    #[error("invalid synchronization protocol: {0}")]
    Protocol(String),
}

impl InteropError {
    pub fn device(message: impl Into<String>) -> Self {
        Self::DeviceCreation(anyhow::anyhow!(message.into()))
    }

    pub fn allocation(message: impl Into<String>) -> Self {
        Self::Allocation(anyhow::anyhow!(message.into()))
    }

    pub fn import(message: impl Into<String>) -> Self {
        Self::Import(anyhow::anyhow!(message.into()))
    }

    pub fn sync_fatal(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::SyncFatal {
            operation,
            reason: reason.into(),
        }
    }

    /// Short name of the failing stage, used in the final diagnostic
    pub fn stage(&self) -> &'static str {
        match self {
            Self::DeviceCreation(_) => "device creation",
            Self::Allocation(_) => "shared allocation",
            Self::Import(_) => "handle import",
            Self::SyncFatal { .. } => "keyed synchronization",
            Self::Protocol(_) => "protocol validation",
        }
    }
}

pub type InteropResult<T> = std::result::Result<T, InteropError>;
