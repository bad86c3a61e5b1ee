use thiserror::Error;

use crate::engine::EngineError;

pub type Result<T> = std::result::Result<T, QuickbeamError>;

/// Protocol-facing failure taxonomy. Every engine-reported failure is mapped
/// into this set at the boundary and returned synchronously to the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickbeamError {
    #[error("not found")]
    NotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("out of resources")]
    OutOfResources,

    #[error("device error")]
    DeviceError,

    #[error("volume corrupted")]
    VolumeCorrupted,

    #[error("volume full")]
    VolumeFull,

    #[error("write protected")]
    WriteProtected,

    #[error("media changed")]
    MediaChanged,

    #[error("no media")]
    NoMedia,

    #[error("busy")]
    Busy,

    #[error("not ready")]
    NotReady,

    #[error("timeout")]
    Timeout,

    #[error("unsupported")]
    Unsupported,

    #[error("protocol error")]
    Protocol,
}

impl From<EngineError> for QuickbeamError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound => QuickbeamError::NotFound,
            EngineError::Exists | EngineError::Locked => QuickbeamError::AccessDenied,
            EngineError::InvalidName => QuickbeamError::InvalidParameter,
            EngineError::Busy => QuickbeamError::Busy,
            EngineError::NotReady => QuickbeamError::NotReady,
            EngineError::Timeout => QuickbeamError::Timeout,
            EngineError::OutOfMemory => QuickbeamError::OutOfResources,
            EngineError::Io => QuickbeamError::DeviceError,
            EngineError::Corrupt => QuickbeamError::VolumeCorrupted,
            EngineError::Full => QuickbeamError::VolumeFull,
            EngineError::ReadOnly => QuickbeamError::WriteProtected,
            EngineError::NoMedia => QuickbeamError::NoMedia,
            EngineError::Unsupported => QuickbeamError::Unsupported,
            EngineError::Protocol => QuickbeamError::Protocol,
        }
    }
}
