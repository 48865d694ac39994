//! Continuous raw stream logging to rotating binary files.
//!
//! The logger is a long-lived background thread that drains the link byte by
//! byte into append-only files named after their creation time. It is the
//! lossless path: as long as the process runs and logging is enabled, every
//! byte the sensor streams ends up on disk. Enabling and disabling never
//! stops the thread, only whether it holds a file open and reads the link;
//! while disabled the thread must not touch the link at all, which is what
//! lets a command exchange borrow it.

use crate::config::LoggerSettings;
use crate::error::AppResult;
use crate::link::SharedLink;
use chrono::{DateTime, Datelike, Local, Timelike};
use log::{debug, error, info};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Idle sleep while logging is disabled.
const IDLE_DISABLED: Duration = Duration::from_millis(10);

/// Idle sleep when the link has no byte ready.
const IDLE_NO_DATA: Duration = Duration::from_millis(1);

/// Back-off after a filesystem or link error.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Combined task/flag state reported by [`SerialLogger::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerStatus {
    /// The background thread is not alive.
    Stopped,
    /// The thread is alive and writing (or ready to write) stream bytes.
    Logging,
    /// The thread is alive but logging is disabled.
    Idle,
}

struct LoggerShared {
    enabled: AtomicBool,
    stop: AtomicBool,
}

/// Handle to the raw stream logger thread.
pub struct SerialLogger {
    shared: Arc<LoggerShared>,
    handle: Option<JoinHandle<()>>,
}

impl SerialLogger {
    /// Creates the log directory and launches the logger thread, disabled.
    ///
    /// Call [`enable`](Self::enable) once the sensor is streaming.
    pub fn spawn(link: SharedLink, settings: LoggerSettings) -> AppResult<Self> {
        Self::spawn_with_tap(link, settings, None)
    }

    /// Like [`spawn`](Self::spawn), with a hand-off channel for an
    /// independent stream consumer.
    ///
    /// Logged bytes are forwarded with a non-blocking send; a full or
    /// disconnected receiver never stalls the disk path. No core component
    /// attaches a consumer today.
    pub fn spawn_with_tap(
        link: SharedLink,
        settings: LoggerSettings,
        tap: Option<SyncSender<u8>>,
    ) -> AppResult<Self> {
        std::fs::create_dir_all(&settings.directory)?;
        info!(
            "Raw log files will be written to {}",
            settings.directory.display()
        );

        let shared = Arc::new(LoggerShared {
            enabled: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("serial-logger".to_string())
            .spawn(move || run_loop(&link, &settings, tap.as_ref(), &thread_shared))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Enables logging. Takes effect within one loop iteration.
    pub fn enable(&self) {
        self.shared.enabled.store(true, Ordering::SeqCst);
        info!("Sensor stream logging enabled");
    }

    /// Disables logging; the current file is closed by the thread. The
    /// thread keeps running and can be re-enabled at any time.
    pub fn disable(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        info!("Sensor stream logging disabled");
    }

    /// Whether logging is currently enabled.
    pub fn is_logging(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Reports the combined thread/flag state.
    pub fn status(&self) -> LoggerStatus {
        match &self.handle {
            Some(handle) if !handle.is_finished() => {
                if self.is_logging() {
                    LoggerStatus::Logging
                } else {
                    LoggerStatus::Idle
                }
            }
            _ => LoggerStatus::Stopped,
        }
    }

    /// Stops the thread: the current iteration completes, any open file is
    /// closed, and the thread is joined.
    pub fn shutdown(mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Logger thread panicked before shutdown");
            }
        }
        info!("Serial logger shut down");
    }
}

impl Drop for SerialLogger {
    fn drop(&mut self) {
        // A dropped handle must not leave the thread reading the link.
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

/// Names a log file after its creation instant, one-second resolution.
fn log_file_name(now: &DateTime<Local>) -> String {
    format!(
        "{}{}{}_{}-{}-{}.bin",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn open_log_file(directory: &Path) -> std::io::Result<(File, PathBuf)> {
    let path = directory.join(log_file_name(&Local::now()));
    let file = OpenOptions::new().append(true).create(true).open(&path)?;
    Ok((file, path))
}

fn run_loop(
    link: &SharedLink,
    settings: &LoggerSettings,
    tap: Option<&SyncSender<u8>>,
    shared: &LoggerShared,
) {
    let mut file: Option<(File, PathBuf)> = None;
    let mut bytes_since_check: u64 = 0;

    while !shared.stop.load(Ordering::SeqCst) {
        if !shared.enabled.load(Ordering::SeqCst) {
            if file.take().is_some() {
                debug!("Log file closed while logging is disabled");
            }
            std::thread::sleep(IDLE_DISABLED);
            continue;
        }

        if file.is_none() {
            match open_log_file(&settings.directory) {
                Ok((handle, path)) => {
                    info!("Logging sensor stream to {}", path.display());
                    bytes_since_check = 0;
                    file = Some((handle, path));
                }
                Err(e) => {
                    error!("Could not open log file: {e}");
                    std::thread::sleep(RETRY_DELAY);
                    continue;
                }
            }
        }

        let byte = link.lock().read_byte();
        match byte {
            Ok(Some(byte)) => {
                let Some((handle, path)) = file.as_mut() else {
                    continue;
                };
                if let Err(e) = handle.write_all(&[byte]) {
                    error!("Log write failed: {e}");
                    std::thread::sleep(RETRY_DELAY);
                    continue;
                }
                if let Some(tap) = tap {
                    let _ = tap.try_send(byte);
                }
                bytes_since_check += 1;

                // Stat only once per interval; a single write may overshoot
                // the cap by at most its own size.
                if bytes_since_check >= settings.size_check_interval {
                    bytes_since_check = 0;
                    match std::fs::metadata(&*path) {
                        Ok(meta) if meta.len() >= settings.max_file_size => {
                            debug!(
                                "Rotating log file {} at {} bytes",
                                path.display(),
                                meta.len()
                            );
                            file = None;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("Log file size check failed: {e}");
                            std::thread::sleep(RETRY_DELAY);
                        }
                    }
                }
            }
            Ok(None) => std::thread::sleep(IDLE_NO_DATA),
            Err(e) => {
                error!("Link read failed while logging: {e}");
                std::thread::sleep(RETRY_DELAY);
            }
        }
    }

    if let Some((_, path)) = file.take() {
        info!("Logger stopping, closing {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_uses_unpadded_local_fields() {
        let when = Local.with_ymd_and_hms(2025, 9, 5, 7, 4, 3).unwrap();
        assert_eq!(log_file_name(&when), "202595_7-4-3.bin");
    }

    #[test]
    fn file_name_keeps_two_digit_fields_intact() {
        let when = Local.with_ymd_and_hms(2024, 12, 31, 23, 59, 58).unwrap();
        assert_eq!(log_file_name(&when), "20241231_23-59-58.bin");
    }
}
