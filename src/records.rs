//! Fixed-layout wire records and payload compression.
//!
//! Record layouts are a wire contract shared with the ingest side: field
//! order and width must round-trip exactly through encode/decode, so both
//! directions live here side by side. All integers and floats are
//! little-endian. Payloads are zlib-compressed before publishing.

use crate::error::{AppResult, SensorError};
use bytes::{Buf, BufMut};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

/// Encoded size of a [`HighFreqRecord`]: 9 x f32 + u64.
pub const HIGH_FREQ_RECORD_LEN: usize = 44;

/// Encoded size of an [`EnvRecord`]: 4 x f32 + u64 + u8.
pub const ENV_RECORD_LEN: usize = 25;

/// Compression level for published payloads.
const COMPRESSION_LEVEL: u32 = 6;

/// One high-frequency sample: strain, principal strain and acceleration
/// channels plus a nanosecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighFreqRecord {
    /// Strain along x.
    pub strain_x: f32,
    /// Strain along y.
    pub strain_y: f32,
    /// Strain along z.
    pub strain_z: f32,
    /// First principal strain.
    pub strain_p1: f32,
    /// Second principal strain.
    pub strain_p2: f32,
    /// Principal strain angle in degrees.
    pub strain_pdeg: f32,
    /// Acceleration along x in m/s^2.
    pub accel_x: f32,
    /// Acceleration along y in m/s^2.
    pub accel_y: f32,
    /// Acceleration along z in m/s^2.
    pub accel_z: f32,
    /// Sample timestamp, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
}

impl HighFreqRecord {
    /// Appends the encoded record to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_f32_le(self.strain_x);
        buf.put_f32_le(self.strain_y);
        buf.put_f32_le(self.strain_z);
        buf.put_f32_le(self.strain_p1);
        buf.put_f32_le(self.strain_p2);
        buf.put_f32_le(self.strain_pdeg);
        buf.put_f32_le(self.accel_x);
        buf.put_f32_le(self.accel_y);
        buf.put_f32_le(self.accel_z);
        buf.put_u64_le(self.timestamp_ns);
    }

    /// Encodes the record as a standalone buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HIGH_FREQ_RECORD_LEN);
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes one record from the start of `data`.
    pub fn decode(mut data: &[u8]) -> AppResult<Self> {
        if data.len() < HIGH_FREQ_RECORD_LEN {
            return Err(SensorError::MalformedRecord(
                "high-frequency record shorter than 44 bytes",
            ));
        }
        Ok(Self {
            strain_x: data.get_f32_le(),
            strain_y: data.get_f32_le(),
            strain_z: data.get_f32_le(),
            strain_p1: data.get_f32_le(),
            strain_p2: data.get_f32_le(),
            strain_pdeg: data.get_f32_le(),
            accel_x: data.get_f32_le(),
            accel_y: data.get_f32_le(),
            accel_z: data.get_f32_le(),
            timestamp_ns: data.get_u64_le(),
        })
    }
}

/// One environment sample: battery and weather channels, a nanosecond
/// timestamp and the originating sensor id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvRecord {
    /// Battery voltage in volts.
    pub v_batt: f32,
    /// Temperature in degrees Celsius.
    pub temperature: f32,
    /// Relative humidity in percent.
    pub humidity: f32,
    /// Barometric pressure in hPa.
    pub pressure: f32,
    /// Sample timestamp, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Originating sensor id.
    pub sensor_id: u8,
}

impl EnvRecord {
    /// Encodes the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENV_RECORD_LEN);
        buf.put_f32_le(self.v_batt);
        buf.put_f32_le(self.temperature);
        buf.put_f32_le(self.humidity);
        buf.put_f32_le(self.pressure);
        buf.put_u64_le(self.timestamp_ns);
        buf.put_u8(self.sensor_id);
        buf
    }

    /// Decodes one record from the start of `data`.
    pub fn decode(mut data: &[u8]) -> AppResult<Self> {
        if data.len() < ENV_RECORD_LEN {
            return Err(SensorError::MalformedRecord(
                "environment record shorter than 25 bytes",
            ));
        }
        Ok(Self {
            v_batt: data.get_f32_le(),
            temperature: data.get_f32_le(),
            humidity: data.get_f32_le(),
            pressure: data.get_f32_le(),
            timestamp_ns: data.get_u64_le(),
            sensor_id: data.get_u8(),
        })
    }
}

/// Concatenates a batch of records in append order.
pub fn encode_batch(records: &[HighFreqRecord]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(records.len() * HIGH_FREQ_RECORD_LEN);
    for record in records {
        record.encode_into(&mut buf);
    }
    buf
}

/// Compresses a payload for publishing (zlib, level 6).
pub fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(payload.len() / 2),
        Compression::new(COMPRESSION_LEVEL),
    );
    encoder.write_all(payload)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    fn sample_record(seq: f32) -> HighFreqRecord {
        HighFreqRecord {
            strain_x: 1.5 + seq,
            strain_y: -2.25,
            strain_z: 0.125,
            strain_p1: 0.0,
            strain_p2: 0.0,
            strain_pdeg: 93.5,
            accel_x: 0.01,
            accel_y: -0.02,
            accel_z: 9.81,
            timestamp_ns: 1_733_500_000_123_456_789,
        }
    }

    #[test]
    fn high_freq_record_round_trips() {
        let record = sample_record(0.0);
        let encoded = record.encode();
        assert_eq!(encoded.len(), HIGH_FREQ_RECORD_LEN);
        let decoded = HighFreqRecord::decode(&encoded).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn env_record_round_trips() {
        let record = EnvRecord {
            v_batt: 3.72,
            temperature: 21.5,
            humidity: 48.0,
            pressure: 1013.2,
            timestamp_ns: 42,
            sensor_id: 7,
        };
        let encoded = record.encode();
        assert_eq!(encoded.len(), ENV_RECORD_LEN);
        let decoded = EnvRecord::decode(&encoded).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(HighFreqRecord::decode(&[0u8; 43]).is_err());
        assert!(EnvRecord::decode(&[0u8; 24]).is_err());
    }

    #[test]
    fn batch_preserves_append_order() {
        let records: Vec<_> = (0..3).map(|i| sample_record(i as f32)).collect();
        let batch = encode_batch(&records);
        assert_eq!(batch.len(), 3 * HIGH_FREQ_RECORD_LEN);
        for (i, chunk) in batch.chunks(HIGH_FREQ_RECORD_LEN).enumerate() {
            let decoded = HighFreqRecord::decode(chunk).expect("decode");
            assert_eq!(decoded, records[i]);
        }
    }

    #[test]
    fn compressed_payload_inflates_back() {
        let batch = encode_batch(&[sample_record(0.0), sample_record(1.0)]);
        let compressed = compress(&batch).expect("compress");
        let mut inflated = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut inflated)
            .expect("inflate");
        assert_eq!(inflated, batch);
    }
}
