//! In-memory test doubles for the transport, decoder and broker seams.
//!
//! [`MockLink`] is a scriptable [`Link`]: tests preload stream bytes, or
//! enqueue per-write replies to exercise command/response exchanges, and
//! inspect everything the code under test wrote. [`MemorySink`] records
//! publishes, and [`MockDecoder`] speaks a trivial tagged telegram format.
//! They exist so every pipeline in this crate can be driven without hardware
//! or a broker, in tests and demos alike.

use crate::auxiliary::{AuxSample, AuxiliarySource};
use crate::error::{AppResult, SensorError};
use crate::frame::{DecodedFrame, EnvSample, StrainSample, TelegramDecoder};
use crate::link::Link;
use bytes::Buf;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    open: bool,
    rx: VecDeque<u8>,
    /// Byte repeated forever once `rx` drains; simulates a device that never
    /// stops streaming.
    endless: Option<u8>,
    /// Replies waiting for a write. Each write moves the front entry into
    /// `rx`, which models the half-duplex command/response exchange.
    pending_replies: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    fail_reads: bool,
    fail_writes: bool,
}

/// Scriptable in-memory transport.
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle to a [`MockLink`]'s script and captured traffic.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    /// Creates a closed link plus its scripting handle.
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockHandle { state },
        )
    }

    /// Creates an already-open link plus its scripting handle.
    pub fn new_open() -> (Self, MockHandle) {
        let (link, handle) = Self::new();
        link.state.lock().open = true;
        (link, handle)
    }
}

impl MockHandle {
    /// Appends raw stream bytes for the link to deliver.
    pub fn push_bytes(&self, data: &[u8]) {
        self.state.lock().rx.extend(data.iter().copied());
    }

    /// Enqueues a reply that is delivered after the next write.
    ///
    /// Replies are consumed in FIFO order, one per write, so an exchange of
    /// N writes needs N enqueued replies to stay in sync.
    pub fn enqueue_reply(&self, reply: &[u8]) {
        self.state.lock().pending_replies.push_back(reply.to_vec());
    }

    /// Makes reads return `byte` forever once the scripted bytes run out.
    pub fn set_endless_data(&self, byte: u8) {
        self.state.lock().endless = Some(byte);
    }

    /// Makes every read fail with a transport error.
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Makes every write fail with a transport error.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Number of undelivered stream bytes.
    pub fn buffered(&self) -> usize {
        self.state.lock().rx.len()
    }

    /// Everything written to the link, one entry per `write` call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    /// All written bytes flattened into one buffer.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().writes.concat()
    }
}

impl Link for MockLink {
    fn open(&mut self) -> AppResult<()> {
        self.state.lock().open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn read_byte(&mut self) -> AppResult<Option<u8>> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(SensorError::LinkNotOpen);
        }
        if state.fail_reads {
            return Err(SensorError::Transport("scripted read failure".to_string()));
        }
        match state.rx.pop_front() {
            Some(b) => Ok(Some(b)),
            None => Ok(state.endless),
        }
    }

    fn write(&mut self, data: &[u8]) -> AppResult<usize> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(SensorError::LinkNotOpen);
        }
        if state.fail_writes {
            return Err(SensorError::Transport("scripted write failure".to_string()));
        }
        state.writes.push(data.to_vec());
        if let Some(reply) = state.pending_replies.pop_front() {
            state.rx.extend(reply);
        }
        Ok(data.len())
    }

    fn pending(&self) -> usize {
        self.state.lock().rx.len()
    }

    fn flush_input(&mut self) -> AppResult<()> {
        self.state.lock().rx.clear();
        Ok(())
    }

    fn flush_output(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().open = false;
    }
}

/// Telegram tag understood by [`MockDecoder`]: strain frame.
pub const MOCK_TAG_STRAIN: u8 = 0x01;
/// Telegram tag understood by [`MockDecoder`]: environment frame.
pub const MOCK_TAG_ENV: u8 = 0x02;

/// Decoder for a trivial tagged telegram format.
///
/// A strain telegram is `[0x01, x, y, z]` and an environment telegram is
/// `[0x02, v_batt, pressure, humidity, temperature]`, each value a
/// little-endian f32. Anything else decodes as invalid.
#[derive(Default)]
pub struct MockDecoder {
    /// When set, [`TelegramDecoder::init`] fails; exercises the publisher's
    /// setup failure path.
    pub fail_init: bool,
}

impl MockDecoder {
    /// Builds a strain telegram (without the frame marker).
    pub fn strain_telegram(x: f32, y: f32, z: f32) -> Vec<u8> {
        let mut telegram = vec![MOCK_TAG_STRAIN];
        for value in [x, y, z] {
            telegram.extend_from_slice(&value.to_le_bytes());
        }
        telegram
    }

    /// Builds an environment telegram (without the frame marker).
    pub fn env_telegram(v_batt: f32, pressure: f32, humidity: f32, temperature: f32) -> Vec<u8> {
        let mut telegram = vec![MOCK_TAG_ENV];
        for value in [v_batt, pressure, humidity, temperature] {
            telegram.extend_from_slice(&value.to_le_bytes());
        }
        telegram
    }
}

impl TelegramDecoder for MockDecoder {
    fn init(&mut self) -> anyhow::Result<()> {
        if self.fail_init {
            anyhow::bail!("scripted decoder setup failure");
        }
        Ok(())
    }

    fn decode(&mut self, telegram: &[u8]) -> DecodedFrame {
        match telegram.split_first() {
            Some((&MOCK_TAG_STRAIN, mut rest)) if rest.len() == 12 => {
                DecodedFrame::Strain(StrainSample {
                    x: rest.get_f32_le(),
                    y: rest.get_f32_le(),
                    z: rest.get_f32_le(),
                })
            }
            Some((&MOCK_TAG_ENV, mut rest)) if rest.len() == 16 => {
                DecodedFrame::Environment(EnvSample {
                    v_batt: rest.get_f32_le(),
                    pressure: rest.get_f32_le(),
                    humidity: rest.get_f32_le(),
                    temperature: rest.get_f32_le(),
                })
            }
            _ => DecodedFrame::Invalid,
        }
    }
}

/// Auxiliary source returning the same sample every time.
pub struct FixedAux(pub AuxSample);

impl AuxiliarySource for FixedAux {
    fn sample(&mut self) -> AuxSample {
        self.0
    }
}

/// Broker sink that records publishes in memory.
pub struct MemorySink {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    disconnected: Arc<Mutex<bool>>,
    /// When set, every publish fails; exercises the best-effort drop path.
    pub fail_publishes: bool,
}

/// Test-side view of what a [`MemorySink`] received.
#[derive(Clone)]
pub struct MemorySinkHandle {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    disconnected: Arc<Mutex<bool>>,
}

impl MemorySink {
    /// Creates a sink plus its inspection handle.
    pub fn new() -> (Self, MemorySinkHandle) {
        let published = Arc::new(Mutex::new(Vec::new()));
        let disconnected = Arc::new(Mutex::new(false));
        (
            Self {
                published: published.clone(),
                disconnected: disconnected.clone(),
                fail_publishes: false,
            },
            MemorySinkHandle {
                published,
                disconnected,
            },
        )
    }
}

impl crate::broker::BrokerSink for MemorySink {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> AppResult<()> {
        if self.fail_publishes {
            return Err(SensorError::Publish("scripted publish failure".to_string()));
        }
        self.published
            .lock()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn disconnect(&mut self) -> AppResult<()> {
        *self.disconnected.lock() = true;
        Ok(())
    }
}

impl MemorySinkHandle {
    /// All recorded publishes in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    /// Recorded publishes to one topic, in order.
    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Whether the sink was disconnected.
    pub fn is_disconnected(&self) -> bool {
        *self.disconnected.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_bytes_come_back_in_order() {
        let (mut link, handle) = MockLink::new_open();
        handle.push_bytes(b"ab");
        assert_eq!(link.read_byte().expect("read"), Some(b'a'));
        assert_eq!(link.read_byte().expect("read"), Some(b'b'));
        assert_eq!(link.read_byte().expect("read"), None);
    }

    #[test]
    fn each_write_releases_one_reply() {
        let (mut link, handle) = MockLink::new_open();
        handle.enqueue_reply(b"first");
        handle.enqueue_reply(b"second");

        assert_eq!(link.read_byte().expect("read"), None);
        link.write(b"cmd1\r\n").expect("write");
        assert_eq!(link.pending(), 5);
        link.flush_input().expect("flush");
        link.write(b"cmd2\r\n").expect("write");
        assert_eq!(link.read_byte().expect("read"), Some(b's'));
        assert_eq!(handle.writes().len(), 2);
    }

    #[test]
    fn closed_link_rejects_io() {
        let (mut link, _handle) = MockLink::new();
        assert!(matches!(link.read_byte(), Err(SensorError::LinkNotOpen)));
        assert!(matches!(link.write(b"x"), Err(SensorError::LinkNotOpen)));
    }

    #[test]
    fn mock_decoder_round_trips_tagged_telegrams() {
        let mut decoder = MockDecoder::default();
        let strain = decoder.decode(&MockDecoder::strain_telegram(1.0, 2.0, 3.0));
        assert_eq!(
            strain,
            DecodedFrame::Strain(StrainSample {
                x: 1.0,
                y: 2.0,
                z: 3.0
            })
        );
        let env = decoder.decode(&MockDecoder::env_telegram(3.7, 1013.0, 45.0, 20.5));
        assert!(matches!(env, DecodedFrame::Environment(_)));
        assert_eq!(decoder.decode(&[0xFF, 0x00]), DecodedFrame::Invalid);
        assert_eq!(decoder.decode(&[]), DecodedFrame::Invalid);
    }
}
