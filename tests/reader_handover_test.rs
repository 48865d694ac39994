//! One link, several consumers: verifies the caller-enforced single-reader
//! discipline works end to end. The logger is disabled before a command
//! exchange borrows the link, and re-enabled afterwards, the way the
//! embedding application is expected to sequence them.

use std::time::{Duration, Instant};
use strainlink::command::CommandChannel;
use strainlink::config::LoggerSettings;
use strainlink::link::wrap_shared;
use strainlink::logger::SerialLogger;
use strainlink::mock::MockLink;

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn command_exchange_between_logging_sessions() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let (link, handle) = MockLink::new_open();
    let link = wrap_shared(Box::new(link));

    let logger = SerialLogger::spawn(
        link.clone(),
        LoggerSettings {
            directory: dir.path().to_path_buf(),
            ..LoggerSettings::default()
        },
    )
    .expect("spawn logger");

    // session one: the logger owns the link and archives the stream
    handle.push_bytes(&[0x08; 100]);
    logger.enable();
    assert!(wait_for(|| handle.buffered() == 0, Duration::from_secs(5)));
    logger.disable();
    std::thread::sleep(Duration::from_millis(100));

    // hand the link to the command channel: stop reply, three prompt
    // replies for priming, then the queried line
    for _ in 0..4 {
        handle.enqueue_reply(b"\r\n>");
    }
    handle.enqueue_reply(b"time\r\nTime 2024-12-07 14:30:00\r\n>");

    let mut channel = CommandChannel::with_timeouts(
        link.clone(),
        Duration::from_millis(200),
        Duration::from_millis(200),
    );
    let line = channel.get_time().expect("get_time");
    assert_eq!(line, "Time 2024-12-07 14:30:00");

    // session two: back to the logger
    handle.push_bytes(&[0x42; 50]);
    logger.enable();
    assert!(wait_for(|| handle.buffered() == 0, Duration::from_secs(5)));
    logger.shutdown();

    let total: u64 = std::fs::read_dir(dir.path())
        .expect("read log dir")
        .map(|entry| entry.expect("dir entry").metadata().expect("metadata").len())
        .sum();
    assert_eq!(total, 150, "both logging sessions must reach disk intact");
}
