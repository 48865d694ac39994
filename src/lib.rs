//! # strainlink
//!
//! Control and data-capture library for a strain-gauge sensor attached over
//! a serial link. The sensor speaks two dialects on the same wire: a
//! line-oriented ASCII command protocol, and a continuous binary telegram
//! stream once transmission is started. This crate provides the protocol
//! engine and the two background pipelines that consume the stream; menus,
//! port pickers and the telegram decoding math live outside.
//!
//! ## Crate structure
//!
//! - **`link`**: the byte-level transport seam ([`Link`]) with a serial-port
//!   implementation, shared between every consumer. One reader at a time is
//!   the crate-wide contract.
//! - **`command`**: synchronous command/response exchanges
//!   ([`CommandChannel`]): initialize, name/time queries, tare, clock
//!   setting with validation and bounded interactive retries.
//! - **`logger`**: the lossless path ([`SerialLogger`]); drains the raw
//!   stream into size-rotated binary files.
//! - **`publisher`**: the telemetry path ([`TelemetryPublisher`]); decodes
//!   framed telegrams, batches fixed-layout records and publishes them
//!   compressed to an MQTT broker, with pause/resume/stop lifecycle.
//! - **`frame`**, **`records`**: telegram framing and the binary wire
//!   records shared with the ingest side.
//! - **`broker`**, **`auxiliary`**: the broker and auxiliary-signal seams
//!   with their default implementations.
//! - **`mock`**: scriptable in-memory doubles for every seam.
//! - **`config`**, **`error`**: settings structs and the crate error type.
//!
//! Exactly one of the command channel, the logger and the publisher may be
//! reading the link at any instant; arbitration between them belongs to the
//! embedding application.

pub mod auxiliary;
pub mod broker;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod link;
pub mod logger;
pub mod mock;
pub mod publisher;
pub mod records;

pub use command::{CommandChannel, ReplyText, SetTimeOutcome};
pub use config::Settings;
pub use error::{AppResult, SensorError};
pub use link::{wrap_shared, Link, SharedLink};
pub use logger::{LoggerStatus, SerialLogger};
pub use publisher::{PublisherState, TelemetryPublisher};

#[cfg(feature = "instrument_serial")]
pub use link::SerialLink;
