//! Error types for the disk image pipeline.
//!
//! One variant per failure kind. Every fatal kind aborts the build; teardown
//! problems are logged by their owners and never surface here.

use std::path::PathBuf;
use thiserror::Error;

/// Crate result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem access failed
    #[error("I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Incompatible configuration combination, raised before any disk I/O
    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    /// A configured partition or volume cannot hold the data at its path
    #[error("{name} size {configured_mbytes}MB is smaller than the required minimum of {required_mbytes}MB")]
    SizingViolation {
        name: String,
        configured_mbytes: u64,
        required_mbytes: u64,
    },

    /// External tool exited non-zero or could not be spawned
    #[error("{message}: {tool} failed (exit {code:?}): {output}")]
    Command {
        tool: String,
        message: String,
        code: Option<i32>,
        output: String,
    },

    /// A required file or directory does not exist
    #[error("{what} not found: {path}")]
    ResourceNotFound { what: String, path: PathBuf },

    /// Template substitution failed
    #[error("Template error: {kind}: {message}")]
    Template { kind: String, message: String },

    /// The default btrfs subvolume could not be located after setup
    #[error("Failed to find default volume id for '{path}'")]
    VolumeRootId { path: String },

    /// Volume manager setup or validation failed
    #[error("Volume setup failed: {message}")]
    VolumeSetup { message: String },

    #[error("RAID setup failed: {message}")]
    Raid { message: String },

    #[error("LUKS setup failed: {message}")]
    Luks { message: String },

    #[error("Integrity setup failed: {message}")]
    Integrity { message: String },

    /// Hash tree creation or verification metadata failed
    #[error("Verity setup failed: {message}")]
    Verity { message: String },

    #[error("Loop device setup failed: {message}")]
    LoopSetup { message: String },

    #[error("Partitioner error: {message}")]
    Partitioner { message: String },

    #[error("Bootloader error: {message}")]
    Bootloader { message: String },

    /// Operation not provided by the selected backend
    #[error("{what} is not implemented")]
    NotImplemented { what: String },

    #[error("Image size {size} bytes of '{path}' exceeds the limit of {limit} bytes")]
    ImageSizeExceeded { path: PathBuf, size: u64, limit: u64 },

    /// Image description could not be parsed or failed validation
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Boot image snapshot could not be read or has an unsupported version
    #[error("Boot image snapshot error for '{path}': {message}")]
    Snapshot { path: PathBuf, message: String },

    /// Result registry could not be written or loaded
    #[error("Result registry error: {message}")]
    Result { message: String },
}

impl Error {
    /// Wrap an `io::Error` with the path that caused it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Error::Precondition {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn bootloader(message: impl Into<String>) -> Self {
        Error::Bootloader {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Error::ResourceNotFound {
            what: what.into(),
            path: path.into(),
        }
    }
}

/// Attach a path to an `io::Result`.
pub trait IoContext<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
