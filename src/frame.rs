//! Binary telegram framing and the decoder seam.
//!
//! While streaming, the sensor emits back-to-back binary telegrams delimited
//! by a Start-Of-Frame marker byte. [`read_telegram`] collects one telegram
//! from the link; turning its bytes into physical values is the job of an
//! external [`TelegramDecoder`] implementation and stays outside this crate.

use crate::error::AppResult;
use crate::link::SharedLink;
use std::time::{Duration, Instant};

/// Start-Of-Frame marker. A telegram is every byte preceding the next marker.
pub const SOF_MARKER: u8 = 0x08;

/// Idle sleep between polls while waiting for stream bytes.
const POLL_IDLE: Duration = Duration::from_millis(1);

/// Reads one telegram from the link.
///
/// Collects bytes until the next [`SOF_MARKER`] and returns them (the marker
/// itself is consumed and excluded). Returns `Ok(None)` when no complete
/// telegram arrived within `read_window`; any partial bytes are discarded,
/// matching the best-effort nature of the telemetry path.
pub fn read_telegram(link: &SharedLink, read_window: Duration) -> AppResult<Option<Vec<u8>>> {
    let deadline = Instant::now() + read_window;
    let mut telegram = Vec::new();

    loop {
        if Instant::now() >= deadline {
            return Ok(None);
        }
        let byte = link.lock().read_byte()?;
        match byte {
            Some(SOF_MARKER) => return Ok(Some(telegram)),
            Some(b) => telegram.push(b),
            None => std::thread::sleep(POLL_IDLE),
        }
    }
}

/// Strain components decoded from a strain-type telegram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrainSample {
    /// Strain along x.
    pub x: f32,
    /// Strain along y.
    pub y: f32,
    /// Strain along z.
    pub z: f32,
}

/// Environment readings decoded from an environment-type telegram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvSample {
    /// Battery voltage in volts.
    pub v_batt: f32,
    /// Barometric pressure in hPa.
    pub pressure: f32,
    /// Relative humidity in percent.
    pub humidity: f32,
    /// Temperature in degrees Celsius.
    pub temperature: f32,
}

/// Outcome of decoding one telegram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedFrame {
    /// A valid strain-type telegram.
    Strain(StrainSample),
    /// A valid environment-type telegram.
    Environment(EnvSample),
    /// The telegram did not decode to a valid frame. Discarded by callers.
    Invalid,
}

/// Decoder seam for the sensor's binary telegram format.
///
/// The decoding math lives in an external library; implementations adapt it
/// to this trait. A decoder instance belongs to exactly one publisher run.
pub trait TelegramDecoder: Send {
    /// One-time setup, called once before the first [`decode`](Self::decode).
    ///
    /// A failure here aborts the publisher start that owns the decoder.
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Decodes one telegram.
    fn decode(&mut self, telegram: &[u8]) -> DecodedFrame;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::wrap_shared;
    use crate::mock::MockLink;

    #[test]
    fn telegram_is_bytes_before_marker() {
        let (link, handle) = MockLink::new_open();
        handle.push_bytes(&[0x01, 0x02, 0x03, SOF_MARKER, 0xAA]);
        let link = wrap_shared(Box::new(link));

        let telegram = read_telegram(&link, Duration::from_millis(100))
            .expect("read")
            .expect("telegram");
        assert_eq!(telegram, vec![0x01, 0x02, 0x03]);
        // the trailing 0xAA stays buffered for the next telegram
        assert_eq!(handle.buffered(), 1);
    }

    #[test]
    fn immediate_marker_yields_empty_telegram() {
        let (link, handle) = MockLink::new_open();
        handle.push_bytes(&[SOF_MARKER]);
        let link = wrap_shared(Box::new(link));

        let telegram = read_telegram(&link, Duration::from_millis(100))
            .expect("read")
            .expect("telegram");
        assert!(telegram.is_empty());
    }

    #[test]
    fn quiet_link_times_out_with_none() {
        let (link, _handle) = MockLink::new_open();
        let link = wrap_shared(Box::new(link));

        let result = read_telegram(&link, Duration::from_millis(30)).expect("read");
        assert!(result.is_none());
    }
}
