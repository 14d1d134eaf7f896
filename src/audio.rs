//! Framing for audio bursts on the unordered, no-retransmit data channel.
//!
//! Each message is one complete, independent unit: a one-byte marker, the
//! capture metadata, then the opaque payload. The two ends may legitimately
//! disagree on capture format, so the receiver adapts to the metadata rather
//! than assuming 48 kHz mono. Messages that don't carry a well-formed header
//! are treated as legacy raw payloads from peers not yet speaking the framed
//! protocol.

use bytes::Bytes;

use crate::models::AudioPacket;

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: u16 = 1;

/// Frame marker + sample_rate(4, LE) + channels(2, LE).
const FRAME_MARKER: u8 = b'A';
const HEADER_LEN: usize = 7;

pub fn encode(packet: &AudioPacket) -> Bytes {
    let mut msg = Vec::with_capacity(HEADER_LEN + packet.audio.len());
    msg.push(FRAME_MARKER);
    msg.extend_from_slice(&packet.sample_rate.to_le_bytes());
    msg.extend_from_slice(&packet.channels.to_le_bytes());
    msg.extend_from_slice(&packet.audio);
    Bytes::from(msg)
}

/// Decode an inbound data-channel message. Never fails: a malformed message
/// is taken to be a bare legacy payload at the default capture format.
pub fn decode(data: Bytes) -> AudioPacket {
    if data.len() >= HEADER_LEN && data[0] == FRAME_MARKER {
        let sample_rate = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let channels = u16::from_le_bytes([data[5], data[6]]);
        if sample_rate > 0 && channels > 0 {
            return AudioPacket {
                audio: data.slice(HEADER_LEN..),
                sample_rate,
                channels,
            };
        }
    }
    AudioPacket {
        audio: data,
        sample_rate: DEFAULT_SAMPLE_RATE,
        channels: DEFAULT_CHANNELS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_metadata() {
        let packet = AudioPacket {
            audio: Bytes::from_static(b"opus-burst"),
            sample_rate: 44_100,
            channels: 2,
        };
        let decoded = decode(encode(&packet));
        assert_eq!(decoded.sample_rate, 44_100);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.audio, packet.audio);
    }

    #[test]
    fn legacy_raw_payload_gets_default_metadata() {
        let decoded = decode(Bytes::from_static(b"\x01\x02raw opus from an old peer"));
        assert_eq!(decoded.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(decoded.channels, DEFAULT_CHANNELS);
        assert_eq!(&decoded.audio[..], b"\x01\x02raw opus from an old peer");
    }

    #[test]
    fn truncated_header_falls_back_to_raw() {
        let decoded = decode(Bytes::from_static(b"A\x00"));
        assert_eq!(decoded.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(decoded.channels, DEFAULT_CHANNELS);
        assert_eq!(&decoded.audio[..], b"A\x00");
    }

    #[test]
    fn zeroed_metadata_is_treated_as_malformed() {
        // A marker byte followed by zeros is not a plausible frame.
        let data = Bytes::from_static(b"A\x00\x00\x00\x00\x00\x00payload");
        let decoded = decode(data.clone());
        assert_eq!(decoded.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(decoded.audio, data);
    }

    #[test]
    fn empty_payload_round_trips() {
        let packet = AudioPacket {
            audio: Bytes::new(),
            sample_rate: 16_000,
            channels: 1,
        };
        let decoded = decode(encode(&packet));
        assert_eq!(decoded.sample_rate, 16_000);
        assert!(decoded.audio.is_empty());
    }
}
