// error.rs — error taxonomy shared by the host reference path and the
// device path.
//
// Four kinds matter to a caller:
//   InvalidArgument     bad dimensions, thresholds out of order, unsupported
//                       kernel size or mode. Fix the call and retry.
//   OutOfMemory         a device allocation failed. Retrying next frame
//                       may succeed once other work has freed memory.
//   DeviceUnavailable   adapter/device selection or kernel load failed.
//                       The extractor that raised it is poisoned.
//   SizeMismatch        camera count or mask dimensions disagree with the
//                       configuration.
//
// `Config` wraps TOML load/save failures; it never escapes `extract()`.

use thiserror::Error;

/// Errors raised by the extractor and its kernels.
#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device out of memory: {0}")]
    OutOfMemory(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Failures reading or writing a TOML configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

impl ExtractorError {
    /// True for errors after which the owning extractor must be rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExtractorError::DeviceUnavailable(_))
    }

    /// Prefix the message with the camera index that triggered it.
    pub fn for_camera(self, camera: usize) -> Self {
        match self {
            ExtractorError::InvalidArgument(m) => {
                ExtractorError::InvalidArgument(format!("camera {camera}: {m}"))
            }
            ExtractorError::OutOfMemory(m) => {
                ExtractorError::OutOfMemory(format!("camera {camera}: {m}"))
            }
            ExtractorError::DeviceUnavailable(m) => {
                ExtractorError::DeviceUnavailable(format!("camera {camera}: {m}"))
            }
            ExtractorError::SizeMismatch(m) => {
                ExtractorError::SizeMismatch(format!("camera {camera}: {m}"))
            }
            other => other,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ExtractorError>;
