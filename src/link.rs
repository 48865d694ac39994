//! Byte-level transport over the physical sensor connection.
//!
//! [`Link`] is the single seam between the protocol logic and the hardware:
//! the command channel, the raw logger and the telemetry publisher all drive
//! the same object through it. Reads are polls: [`Link::read_byte`] returns
//! `Ok(None)` immediately when nothing is buffered, and callers implement
//! their own wait/retry loops. The trait performs no retries of its own and
//! reports every error.
//!
//! At most one component may be reading the link at any instant. The shared
//! handle ([`SharedLink`]) serializes individual byte operations, but it does
//! not arbitrate ownership; keeping the logger disabled and the publisher
//! paused while a command exchange runs is the caller's responsibility.

use crate::error::AppResult;
use parking_lot::Mutex;
use std::sync::Arc;

#[cfg(feature = "instrument_serial")]
use crate::config::LinkSettings;
#[cfg(feature = "instrument_serial")]
use crate::error::SensorError;
#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_serial")]
use std::time::Duration;

/// Byte-level transport contract.
pub trait Link: Send {
    /// Opens the underlying connection.
    fn open(&mut self) -> AppResult<()>;

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;

    /// Polls for a single byte.
    ///
    /// Returns `Ok(None)` immediately when no byte is buffered; never blocks
    /// waiting for data.
    fn read_byte(&mut self) -> AppResult<Option<u8>>;

    /// Writes bytes, returning the count written.
    fn write(&mut self, data: &[u8]) -> AppResult<usize>;

    /// Number of bytes currently buffered for reading. Reports 0 when the
    /// count cannot be queried.
    fn pending(&self) -> usize;

    /// Discards any buffered incoming bytes.
    fn flush_input(&mut self) -> AppResult<()>;

    /// Discards any queued outgoing bytes.
    fn flush_output(&mut self) -> AppResult<()>;

    /// Closes the connection. Safe to call when already closed.
    fn close(&mut self);
}

/// Shared handle to a link, cloneable across the background tasks.
pub type SharedLink = Arc<Mutex<Box<dyn Link>>>;

/// Wraps a link for sharing between the command channel and the background
/// tasks.
pub fn wrap_shared(link: Box<dyn Link>) -> SharedLink {
    Arc::new(Mutex::new(link))
}

/// Serial port transport for the physical sensor.
///
/// Fixed framing per the sensor's interface: 8 data bits, no parity, one
/// stop bit. Baud rate and port timeout come from [`LinkSettings`].
#[cfg(feature = "instrument_serial")]
pub struct SerialLink {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn serialport::SerialPort>>,
}

#[cfg(feature = "instrument_serial")]
impl SerialLink {
    /// Creates a closed link for the given port.
    pub fn new(port_name: impl Into<String>, settings: &LinkSettings) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: settings.baud_rate,
            timeout: Duration::from_millis(settings.timeout_ms),
            port: None,
        }
    }

    /// Lists serial ports visible on this machine.
    ///
    /// Port selection itself happens outside this crate; this is the
    /// enumeration half of that boundary.
    pub fn available_ports() -> AppResult<Vec<serialport::SerialPortInfo>> {
        serialport::available_ports().map_err(|e| SensorError::Transport(e.to_string()))
    }
}

#[cfg(feature = "instrument_serial")]
impl Link for SerialLink {
    fn open(&mut self) -> AppResult<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(self.timeout)
            .open()
            .map_err(|e| {
                SensorError::Transport(format!("failed to open '{}': {}", self.port_name, e))
            })?;
        log::info!("Connected to {} at {} baud", self.port_name, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read_byte(&mut self) -> AppResult<Option<u8>> {
        let port = self.port.as_mut().ok_or(SensorError::LinkNotOpen)?;
        let waiting = port
            .bytes_to_read()
            .map_err(|e| SensorError::Transport(format!("read poll failed: {e}")))?;
        if waiting == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; 1];
        match port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(SensorError::Transport(format!("read failed: {e}"))),
        }
    }

    fn write(&mut self, data: &[u8]) -> AppResult<usize> {
        let port = self.port.as_mut().ok_or(SensorError::LinkNotOpen)?;
        port.write_all(data)
            .and_then(|()| port.flush())
            .map_err(|e| SensorError::Transport(format!("write failed: {e}")))?;
        Ok(data.len())
    }

    fn pending(&self) -> usize {
        match &self.port {
            Some(port) => match port.bytes_to_read() {
                Ok(n) => n as usize,
                Err(e) => {
                    log::warn!("Could not query pending bytes: {e}");
                    0
                }
            },
            None => 0,
        }
    }

    fn flush_input(&mut self) -> AppResult<()> {
        let port = self.port.as_mut().ok_or(SensorError::LinkNotOpen)?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| SensorError::Transport(format!("input flush failed: {e}")))
    }

    fn flush_output(&mut self) -> AppResult<()> {
        let port = self.port.as_mut().ok_or(SensorError::LinkNotOpen)?;
        port.clear(serialport::ClearBuffer::Output)
            .map_err(|e| SensorError::Transport(format!("output flush failed: {e}")))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("Disconnected from {}", self.port_name);
        }
    }
}
