use crate::Message;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);

    pub fn is_supported(self) -> bool {
        self.0 <= CURRENT_PROTOCOL_VERSION
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u16(self.0)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl<'de> Visitor<'de> for VersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u16::try_from(value)
                    .map(ProtocolVersion)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let value = u64::try_from(value)
                    .map_err(|_| E::custom(format!("negative protocol version: {value}")))?;
                self.visit_u64(value)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value
                    .trim()
                    .trim_start_matches('v')
                    .parse::<u16>()
                    .map(ProtocolVersion)
                    .map_err(|err| E::custom(format!("invalid protocol version '{value}': {err}")))
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    Watch(WatchPayload),
    Message(Message),
    Heartbeat(HeartbeatPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchPayload {
    /// Topic glob; `*` watches every topic.
    #[serde(default = "default_watch_topic")]
    pub topic: String,
    #[serde(default)]
    pub include_dm: bool,
    #[serde(default)]
    pub agent: Option<String>,
}

fn default_watch_topic() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = trim_line_ending(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let raw = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Incremental decoder: feed arbitrary read chunks, get whole frames back.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            let frame = trim_line_ending(&line);
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            self.decode_raw_frame(frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Decodes whatever is left after the peer closed without a trailing newline.
    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let rest = std::mem::take(&mut self.pending);
        if !rest.iter().all(u8::is_ascii_whitespace) {
            self.decode_raw_frame(&rest, &mut report);
        }
        report
    }

    fn decode_raw_frame(&self, frame: &[u8], report: &mut DecodeReport<T>) {
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(frame) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;
    use chrono::{TimeZone, Utc};

    fn envelope(msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            sender_id: "forged".to_string(),
            timestamp: "2026-02-23T12:00:00Z".to_string(),
            request_id: None,
            msg,
        }
    }

    fn pushed_message(id: &str) -> WireEnvelope {
        envelope(WireMsg::Message(Message {
            id: id.to_string(),
            from: "alice".to_string(),
            to: "builds".to_string(),
            time: Utc
                .with_ymd_and_hms(2026, 2, 23, 12, 0, 0)
                .single()
                .expect("valid timestamp"),
            body: "green".to_string(),
            priority: Priority::High,
            tags: ["ci".to_string()].into_iter().collect(),
            reply_to: None,
            host: Some("build-01".to_string()),
        }))
    }

    #[test]
    fn message_frames_survive_the_codec() {
        let original = pushed_message("20260223-120000-0001");
        let frame = encode_frame(&original, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(frame.last(), Some(&b'\n'));
        let decoded: WireEnvelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn decoder_reassembles_split_chunks() {
        let frame = encode_frame(&pushed_message("m1"), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::default();
        assert!(decoder.push_chunk(head).frames.is_empty());
        let report = decoder.push_chunk(tail);
        assert_eq!(report.frames.len(), 1);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn decoder_recovers_after_malformed_json_line() {
        let mut chunk = encode_frame(&pushed_message("m1"), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode first");
        chunk.extend_from_slice(b"{\"not\":\"valid\"\n\n");
        chunk.extend_from_slice(
            &encode_frame(
                &envelope(WireMsg::Heartbeat(HeartbeatPayload { seq: 3 })),
                DEFAULT_MAX_FRAME_BYTES,
            )
            .expect("encode second"),
        );

        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::default();
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
    }

    #[test]
    fn decoder_rejects_oversized_line_and_continues() {
        let oversized = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(2_000));
        let valid = encode_frame(&pushed_message("m1"), DEFAULT_MAX_FRAME_BYTES).expect("encode");

        let mut chunk = oversized.into_bytes();
        chunk.extend_from_slice(&valid);

        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::new(1_024);
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 1);
        assert!(matches!(
            report.errors.as_slice(),
            [FrameError::OversizedFrame { .. }]
        ));
    }

    #[test]
    fn finish_decodes_unterminated_tail() {
        let frame = encode_frame(&pushed_message("m1"), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::default();
        assert!(decoder.push_chunk(&frame[..frame.len() - 1]).frames.is_empty());
        assert_eq!(decoder.finish().frames.len(), 1);
        assert!(decoder.finish().frames.is_empty());
    }

    #[test]
    fn watch_and_version_fields_have_defaults() {
        let parsed: WireEnvelope = serde_json::from_str(
            r#"{
                "version": "v1",
                "type": "watch",
                "sender_id": "client-a",
                "timestamp": "2026-02-23T12:00:00Z",
                "payload": {"include_dm": true}
            }"#,
        )
        .expect("parse watch");
        assert_eq!(parsed.version, ProtocolVersion(1));
        match parsed.msg {
            WireMsg::Watch(payload) => {
                assert_eq!(payload.topic, "*");
                assert!(payload.include_dm);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let future: WireEnvelope = serde_json::from_str(
            r#"{"version": 9, "type": "heartbeat", "sender_id": "forged",
                "timestamp": "2026-02-23T12:00:00Z", "payload": {"seq": 1}}"#,
        )
        .expect("parse heartbeat");
        assert!(!future.version.is_supported());
    }
}
