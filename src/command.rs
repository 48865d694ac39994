//! Synchronous command/response exchanges with the sensor.
//!
//! The sensor speaks a line-oriented ASCII protocol: the host writes a
//! CR LF terminated command and the device answers with text ending in the
//! three-byte prompt sequence `\r\n>`. Each exchange walks the same path:
//! the command is sent, reply bytes accumulate until the prompt or a
//! timeout, and the result is handed back to the caller. Exchanges run
//! synchronously on the caller's thread and block until they complete, so
//! the raw logger must be disabled and the publisher paused or stopped
//! before issuing a command; two readers on one link is a caller error this
//! type cannot detect.
//!
//! A reply that times out is not a fault: the partial text is returned with
//! a flag and a warning log, and the caller decides what to do with it.

use crate::error::{AppResult, SensorError};
use crate::link::SharedLink;
use chrono::{NaiveDate, NaiveDateTime};
use log::{info, warn};
use std::time::{Duration, Instant};

// Command bytes, CR LF terminated as the device expects them.
const CMD_INITIALIZE: &[u8] = b"$\r\n";
const CMD_START_STREAM: &[u8] = b"<scanmb-start>\r\n";
const CMD_STOP_STREAM: &[u8] = b"<scanmb-stop>\r\n";
const CMD_GET_TIME: &[u8] = b"time\r\n";
const CMD_GET_NAME: &[u8] = b"name\r\n";
const CMD_SET_TARE: &[u8] = b"tare all\r\n";
const CMD_BARE_PROMPT: &[u8] = b"\r\n";

/// Reply terminator: the device prompt.
const PROMPT: &[u8] = b"\r\n>";

/// Default window for one reply read.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Default window for draining the stream after a stop command.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// CR LF / consume-reply rounds used to settle the device prompt.
const PRIME_ATTEMPTS: usize = 3;

/// Idle sleep between polls while waiting for reply bytes.
const POLL_IDLE: Duration = Duration::from_millis(10);

/// Accumulated reply text from one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyText {
    /// Decoded reply, exclusive of the prompt. Partial when `timed_out`.
    pub text: String,
    /// Whether the prompt never arrived within the read window.
    pub timed_out: bool,
}

/// Outcome of an interactive time-setting session.
#[derive(Debug, Clone, PartialEq)]
pub enum SetTimeOutcome {
    /// A candidate validated and was applied on the device.
    Applied {
        /// The time that was sent.
        time: NaiveDateTime,
        /// The device's confirmation line.
        confirmation: String,
    },
    /// The operator entered a cancel keyword.
    Cancelled,
    /// Every attempt failed validation.
    AttemptsExhausted,
}

/// Synchronous command channel over a shared link.
pub struct CommandChannel {
    link: SharedLink,
    read_timeout: Duration,
    drain_timeout: Duration,
}

impl CommandChannel {
    /// Creates a channel with the standard 2 s reply and 5 s drain windows.
    pub fn new(link: SharedLink) -> Self {
        Self::with_timeouts(link, READ_TIMEOUT, DRAIN_TIMEOUT)
    }

    /// Creates a channel with explicit reply and drain windows.
    pub fn with_timeouts(link: SharedLink, read_timeout: Duration, drain_timeout: Duration) -> Self {
        Self {
            link,
            read_timeout,
            drain_timeout,
        }
    }

    fn write_link(&self, data: &[u8]) -> AppResult<()> {
        self.link.lock().write(data)?;
        Ok(())
    }

    fn read_one(&self) -> AppResult<Option<u8>> {
        self.link.lock().read_byte()
    }

    /// Commands the sensor to start streaming binary telegrams.
    pub fn start_transmission(&mut self) -> AppResult<()> {
        self.write_link(CMD_START_STREAM)
    }

    /// Commands the sensor to stop streaming, then drains the link.
    ///
    /// Drains until a read cycle yields no data, bounded by the drain
    /// window. A device that keeps the buffer full for the whole window is
    /// treated as stuck: a bare CR LF forces a fresh prompt and one bounded
    /// recovery read resynchronizes the exchange.
    pub fn stop_transmission(&mut self) -> AppResult<()> {
        self.write_link(CMD_STOP_STREAM)?;

        let deadline = Instant::now() + self.drain_timeout;
        let mut drained = false;
        while Instant::now() < deadline {
            if self.read_one()?.is_none() {
                drained = true;
                break;
            }
        }

        if !drained {
            warn!("Stream buffer never emptied after stop command, forcing prompt");
            self.write_link(CMD_BARE_PROMPT)?;
            self.read_until_prompt(self.read_timeout)?;
        }
        Ok(())
    }

    /// Sends CR LF and consumes the reply, `attempts` times, so the device
    /// is sitting at a fresh prompt before the next command.
    pub fn prime_for_command(&mut self, attempts: usize) -> AppResult<()> {
        for _ in 0..attempts {
            self.write_link(CMD_BARE_PROMPT)?;
            self.read_until_prompt(self.read_timeout)?;
        }
        Ok(())
    }

    /// Reads reply bytes until the device prompt or the timeout.
    ///
    /// Keeps a trailing three-byte window over the incoming bytes and stops
    /// the moment it equals `\r\n>`; the returned text is exactly the bytes
    /// before that sequence, decoded leniently (invalid bytes are replaced,
    /// never an error). On timeout the partial text comes back with the
    /// `timed_out` flag set and a warning is logged.
    pub fn read_until_prompt(&mut self, timeout: Duration) -> AppResult<ReplyText> {
        let mut buf: Vec<u8> = Vec::new();
        let deadline = Instant::now() + timeout;
        let mut timed_out = true;

        while Instant::now() < deadline {
            match self.read_one()? {
                Some(byte) => {
                    buf.push(byte);
                    if buf.ends_with(PROMPT) {
                        buf.truncate(buf.len() - PROMPT.len());
                        timed_out = false;
                        break;
                    }
                }
                None => std::thread::sleep(POLL_IDLE),
            }
        }

        if timed_out {
            warn!(
                "Timeout waiting for sensor prompt ({} bytes buffered)",
                buf.len()
            );
        }

        Ok(ReplyText {
            text: String::from_utf8_lossy(&buf).into_owned(),
            timed_out,
        })
    }

    /// Stops streaming, primes the prompt, sends one command and returns the
    /// first reply line starting with `prefix`.
    fn query_line(&mut self, command: &[u8], prefix: &'static str) -> AppResult<String> {
        self.stop_transmission()?;
        self.prime_for_command(PRIME_ATTEMPTS)?;
        self.write_link(command)?;
        let reply = self.read_until_prompt(self.read_timeout)?;
        Self::find_prefixed_line(&reply.text, prefix)
    }

    fn find_prefixed_line(text: &str, prefix: &'static str) -> AppResult<String> {
        text.split("\r\n")
            .find(|line| line.starts_with(prefix))
            .map(str::to_string)
            .ok_or(SensorError::ReplyNotFound(prefix))
    }

    /// Requests the sensor's identification banner.
    ///
    /// The reply is filtered down to its informational lines: blank lines
    /// and control-character noise are dropped, as are the first and last
    /// surviving lines (echo and prompt remnants).
    pub fn initialize(&mut self) -> AppResult<String> {
        self.stop_transmission()?;
        self.prime_for_command(PRIME_ATTEMPTS)?;
        self.write_link(CMD_INITIALIZE)?;
        let reply = self.read_until_prompt(self.read_timeout)?;

        let lines: Vec<String> = reply
            .text
            .split("\r\n")
            .map(|line| line.replace('\n', "").trim().to_string())
            .filter(|line| !line.is_empty())
            .filter(|line| !line.chars().all(is_control_noise))
            .collect();

        if lines.is_empty() {
            return Err(SensorError::ReplyNotFound("banner"));
        }
        if lines.len() <= 2 {
            return Ok(String::new());
        }
        Ok(lines[1..lines.len() - 1].join("\n"))
    }

    /// Queries the sensor's name; returns the `Name`-prefixed reply line.
    pub fn get_name(&mut self) -> AppResult<String> {
        self.query_line(CMD_GET_NAME, "Name")
    }

    /// Queries the sensor's internal clock; returns the `Time`-prefixed
    /// reply line.
    pub fn get_time(&mut self) -> AppResult<String> {
        self.query_line(CMD_GET_TIME, "Time")
    }

    /// Sets the sensor's internal clock.
    ///
    /// The command always carries zero seconds; minute resolution is all the
    /// device accepts. Returns the `Time`-prefixed confirmation line.
    pub fn set_time(&mut self, when: NaiveDateTime) -> AppResult<String> {
        self.stop_transmission()?;
        self.prime_for_command(PRIME_ATTEMPTS)?;
        let command = format!("time {}-00\r\n", when.format("%Y-%m-%d-%H-%M"));
        self.write_link(command.as_bytes())?;
        let reply = self.read_until_prompt(self.read_timeout)?;
        Self::find_prefixed_line(&reply.text, "Time")
    }

    /// Applies a new tare; returns the `X`-prefixed confirmation line.
    pub fn set_tare(&mut self) -> AppResult<String> {
        self.query_line(CMD_SET_TARE, "X")
    }

    /// Validates a `yyyy-mm-dd-hh-mm` candidate string.
    ///
    /// Each violation class gets its own operator-readable message: overall
    /// format, month range, day-for-month, hour range, minute range and the
    /// 1900..=2100 year window (checked last, after the date itself parses).
    pub fn validate_time_format(input: &str) -> AppResult<NaiveDateTime> {
        let bad_format = || {
            SensorError::InvalidTimeFormat(
                "Invalid format. Expected: yyyy-mm-dd-hh-mm (e.g., 2024-12-07-14-30)".to_string(),
            )
        };
        let invalid = |message: &str| SensorError::InvalidTimeFormat(message.to_string());

        let parts: Vec<&str> = input.trim().split('-').collect();
        if parts.len() != 5 {
            return Err(bad_format());
        }
        let widths = [4usize, 2, 2, 2, 2];
        for (part, width) in parts.iter().zip(widths) {
            if part.len() != width || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(bad_format());
            }
        }

        let year: i32 = parts[0].parse().map_err(|_| bad_format())?;
        let month: u32 = parts[1].parse().map_err(|_| bad_format())?;
        let day: u32 = parts[2].parse().map_err(|_| bad_format())?;
        let hour: u32 = parts[3].parse().map_err(|_| bad_format())?;
        let minute: u32 = parts[4].parse().map_err(|_| bad_format())?;

        if !(1..=12).contains(&month) {
            return Err(invalid("Month must be between 1-12"));
        }
        let date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| invalid("Invalid day for the given month"))?;
        if hour > 23 {
            return Err(invalid("Hour must be between 0-23"));
        }
        if minute > 59 {
            return Err(invalid("Minute must be between 0-59"));
        }
        if !(1900..=2100).contains(&year) {
            return Err(invalid("Year must be between 1900 and 2100"));
        }

        date.and_hms_opt(hour, minute, 0).ok_or_else(bad_format)
    }

    /// Interactive time setting with bounded retries.
    ///
    /// Candidate strings come from `read_input` (stdin, a UI, a test
    /// script); the keywords `quit`, `exit` and `cancel` abort. Invalid
    /// candidates are reported together with the remaining attempt count;
    /// after `max_attempts` failures the session gives up.
    pub fn set_time_interactive<F>(
        &mut self,
        mut read_input: F,
        max_attempts: usize,
    ) -> AppResult<SetTimeOutcome>
    where
        F: FnMut() -> AppResult<String>,
    {
        let mut attempt = 0;
        while attempt < max_attempts {
            let candidate = read_input()?;
            let candidate = candidate.trim();
            if matches!(
                candidate.to_ascii_lowercase().as_str(),
                "quit" | "exit" | "cancel"
            ) {
                info!("Time setting cancelled");
                return Ok(SetTimeOutcome::Cancelled);
            }

            match Self::validate_time_format(candidate) {
                Ok(when) => {
                    let confirmation = self.set_time(when)?;
                    info!("Sensor time set, device replied: {confirmation}");
                    return Ok(SetTimeOutcome::Applied { time: when, confirmation });
                }
                Err(e) => {
                    attempt += 1;
                    warn!("{e}");
                    if attempt < max_attempts {
                        warn!("Please try again ({} attempts remaining)", max_attempts - attempt);
                    }
                }
            }
        }
        Ok(SetTimeOutcome::AttemptsExhausted)
    }
}

/// Control characters that show up as framing noise in banner replies.
fn is_control_noise(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0b}' | '\u{0c}' | '\u{0e}' | '\u{0f}')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::wrap_shared;
    use crate::mock::{MockHandle, MockLink};

    fn channel(read_ms: u64, drain_ms: u64) -> (CommandChannel, MockHandle) {
        let (link, handle) = MockLink::new_open();
        let channel = CommandChannel::with_timeouts(
            wrap_shared(Box::new(link)),
            Duration::from_millis(read_ms),
            Duration::from_millis(drain_ms),
        );
        (channel, handle)
    }

    /// Enqueues the replies a stop + prime + query exchange consumes: one for
    /// the stop command, one prompt per prime round, then the final reply.
    fn script_query(handle: &MockHandle, reply: &[u8]) {
        handle.enqueue_reply(b"\r\n>");
        for _ in 0..PRIME_ATTEMPTS {
            handle.enqueue_reply(b"\r\n>");
        }
        handle.enqueue_reply(reply);
    }

    #[test]
    fn read_until_prompt_returns_bytes_before_terminator() {
        let (mut channel, handle) = channel(200, 200);
        handle.push_bytes(b"Name sensor-a\r\n>");

        let reply = channel
            .read_until_prompt(Duration::from_millis(200))
            .expect("read");
        assert_eq!(reply.text, "Name sensor-a");
        assert!(!reply.timed_out);
    }

    #[test]
    fn read_until_prompt_times_out_with_partial_text() {
        let (mut channel, handle) = channel(50, 50);
        handle.push_bytes(b"partial reply without prompt");

        let reply = channel
            .read_until_prompt(Duration::from_millis(50))
            .expect("read");
        assert!(reply.timed_out);
        assert_eq!(reply.text, "partial reply without prompt");
    }

    #[test]
    fn read_until_prompt_decodes_leniently() {
        let (mut channel, handle) = channel(200, 200);
        handle.push_bytes(b"ok\xFFok\r\n>");

        let reply = channel
            .read_until_prompt(Duration::from_millis(200))
            .expect("read");
        assert!(!reply.timed_out);
        assert_eq!(reply.text, "ok\u{FFFD}ok");
    }

    #[test]
    fn start_transmission_writes_start_command() {
        let (mut channel, handle) = channel(50, 50);
        channel.start_transmission().expect("start");
        assert_eq!(handle.writes(), vec![b"<scanmb-start>\r\n".to_vec()]);
    }

    #[test]
    fn stop_transmission_drains_quietly() {
        let (mut channel, handle) = channel(100, 100);
        handle.enqueue_reply(b"trailing stream bytes");

        channel.stop_transmission().expect("stop");
        // stop command written, trailing bytes drained, no forced prompt
        assert_eq!(handle.writes(), vec![CMD_STOP_STREAM.to_vec()]);
        assert_eq!(handle.buffered(), 0);
    }

    #[test]
    fn stuck_stream_forces_prompt_and_recovery_read() {
        let (mut channel, handle) = channel(50, 50);
        handle.set_endless_data(b'x');

        channel.stop_transmission().expect("stop");
        let writes = handle.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], CMD_STOP_STREAM.to_vec());
        assert_eq!(writes[1], CMD_BARE_PROMPT.to_vec());
    }

    #[test]
    fn get_time_selects_time_line() {
        let (mut channel, handle) = channel(200, 100);
        script_query(&handle, b"time\r\nTime 2024-12-07 14:30:00\r\n>");

        let line = channel.get_time().expect("get_time");
        assert_eq!(line, "Time 2024-12-07 14:30:00");
        // stop + 3 primes + query
        assert_eq!(handle.writes().len(), 5);
        assert_eq!(handle.writes()[4], CMD_GET_TIME.to_vec());
    }

    #[test]
    fn get_name_without_match_is_not_found() {
        let (mut channel, handle) = channel(200, 100);
        script_query(&handle, b"no such field here\r\n>");

        match channel.get_name() {
            Err(SensorError::ReplyNotFound(prefix)) => assert_eq!(prefix, "Name"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn set_tare_selects_x_line() {
        let (mut channel, handle) = channel(200, 100);
        script_query(&handle, b"tare all\r\nX 0.0012 Y 0.0034\r\n>");

        let line = channel.set_tare().expect("set_tare");
        assert!(line.starts_with("X "));
    }

    #[test]
    fn initialize_drops_banner_edges_and_noise() {
        let (mut channel, handle) = channel(200, 100);
        script_query(
            &handle,
            b"$\r\n\x01\x02\r\n\r\nSerial 00123\r\nFirmware 2.4\r\nTime 2024\r\n>",
        );

        let info = channel.initialize().expect("initialize");
        // first ("$") and last ("Time 2024") surviving lines are dropped
        assert_eq!(info, "Serial 00123\nFirmware 2.4");
    }

    #[test]
    fn initialize_with_noise_only_reply_is_not_found() {
        let (mut channel, handle) = channel(200, 100);
        script_query(&handle, b"\x01\x02\r\n\r\n\x0b\r\n>");

        assert!(matches!(
            channel.initialize(),
            Err(SensorError::ReplyNotFound("banner"))
        ));
    }

    #[test]
    fn set_time_formats_command_with_zero_seconds() {
        let (mut channel, handle) = channel(200, 100);
        script_query(&handle, b"Time 2024-12-07 14:30:00\r\n>");

        let when = CommandChannel::validate_time_format("2024-12-07-14-30").expect("valid");
        channel.set_time(when).expect("set_time");
        assert_eq!(handle.writes()[4], b"time 2024-12-07-14-30-00\r\n".to_vec());
    }

    #[test]
    fn validate_time_format_accepts_and_rejects_by_class() {
        assert!(CommandChannel::validate_time_format("2024-12-07-14-30").is_ok());

        let cases = [
            ("2024-12-07", "Invalid format"),
            ("2024/12/07 14:30", "Invalid format"),
            ("24-12-07-14-30", "Invalid format"),
            ("2024-13-07-14-30", "Month must be between 1-12"),
            ("2024-02-30-14-30", "Invalid day for the given month"),
            ("2024-12-07-24-30", "Hour must be between 0-23"),
            ("2024-12-07-14-60", "Minute must be between 0-59"),
            ("1899-12-07-14-30", "Year must be between 1900 and 2100"),
            ("2101-01-01-00-00", "Year must be between 1900 and 2100"),
        ];
        for (input, expected) in cases {
            match CommandChannel::validate_time_format(input) {
                Err(SensorError::InvalidTimeFormat(msg)) => assert!(
                    msg.contains(expected),
                    "input {input}: message '{msg}' missing '{expected}'"
                ),
                other => panic!("input {input}: unexpected result {other:?}"),
            }
        }
    }

    #[test]
    fn leap_day_is_accepted() {
        assert!(CommandChannel::validate_time_format("2024-02-29-00-00").is_ok());
        assert!(CommandChannel::validate_time_format("2023-02-29-00-00").is_err());
    }

    #[test]
    fn interactive_set_time_exhausts_attempts() {
        let (mut channel, _handle) = channel(50, 50);
        let mut served = 0;
        let outcome = channel
            .set_time_interactive(
                || {
                    served += 1;
                    Ok("not-a-time".to_string())
                },
                3,
            )
            .expect("interactive");
        assert_eq!(outcome, SetTimeOutcome::AttemptsExhausted);
        assert_eq!(served, 3);
    }

    #[test]
    fn interactive_set_time_honours_cancel_keyword() {
        let (mut channel, _handle) = channel(50, 50);
        let outcome = channel
            .set_time_interactive(|| Ok("cancel".to_string()), 3)
            .expect("interactive");
        assert_eq!(outcome, SetTimeOutcome::Cancelled);
    }

    #[test]
    fn interactive_set_time_applies_valid_candidate() {
        let (mut channel, handle) = channel(200, 100);
        script_query(&handle, b"Time 2024-12-07 14:30:00\r\n>");

        let mut inputs = vec!["2024-12-07-14-30".to_string(), "garbage".to_string()];
        let outcome = channel
            .set_time_interactive(|| Ok(inputs.pop().expect("scripted input")), 3)
            .expect("interactive");
        match outcome {
            SetTimeOutcome::Applied { time, confirmation } => {
                assert_eq!(time.format("%Y-%m-%d-%H-%M").to_string(), "2024-12-07-14-30");
                assert!(confirmation.starts_with("Time"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
