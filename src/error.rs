//! Custom error types for the crate.
//!
//! `SensorError` consolidates the failure modes of the transport, the command
//! channel, the raw logger and the telemetry publisher into one `thiserror`
//! enum. Expected, recoverable protocol conditions (a reply that times out,
//! a reply line that is missing) are kept distinct from true faults (setup
//! failures, I/O errors) so callers can retry the former and abort on the
//! latter.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SensorError>;

/// Primary error type for instrument control and telemetry.
#[derive(Error, Debug)]
pub enum SensorError {
    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Standard I/O operation failed (file system, port handle).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation was attempted on a link that is not open.
    ///
    /// Typically a sequencing error: the caller must open the link before
    /// reading, writing or querying pending bytes.
    #[error("Link is not open")]
    LinkNotOpen,

    /// The transport failed while reading or writing.
    ///
    /// Surfaced to the caller of the failing operation; background tasks log
    /// it and keep running.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The sensor reply did not contain the expected content.
    ///
    /// A recoverable condition: the exchange completed (or timed out) but no
    /// reply line carried the expected prefix. The caller decides whether to
    /// retry the command.
    #[error("Sensor reply did not contain expected '{0}' content")]
    ReplyNotFound(&'static str),

    /// A candidate time string failed validation.
    ///
    /// The message names the specific violation (format, month, day, hour,
    /// minute or year range) so it can be shown to an operator verbatim.
    #[error("{0}")]
    InvalidTimeFormat(String),

    /// Decoder or broker setup failed while starting the publisher.
    ///
    /// Fatal to that start attempt only; partially acquired resources are
    /// released before this is returned.
    #[error("Connection setup error: {0}")]
    ConnectionSetup(String),

    /// The broker rejected or dropped a publish.
    ///
    /// Telemetry is best effort: the record is not retried.
    #[error("Publish error: {0}")]
    Publish(String),

    /// A fixed-layout wire record could not be decoded.
    #[error("Malformed record: {0}")]
    MalformedRecord(&'static str),

    /// `start()` was called on a publisher whose task is still alive.
    #[error("Publisher is already running")]
    AlreadyRunning,

    /// A lifecycle control was called on a publisher that is not running.
    #[error("Publisher is not running")]
    NotRunning,

    /// The publisher task did not exit within the stop timeout.
    ///
    /// The task is left running; the caller may retry `stop()`.
    #[error("Publisher task did not stop within {0:?}")]
    PublisherStuck(Duration),
}
