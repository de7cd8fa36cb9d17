//! Inbound payload decoding
//!
//! Three tiers, evaluated in order:
//! 1. explicit output types convert directly, and `json` failures are hard errors;
//! 2. under `auto`/`auto-detect`, a v5 format indicator or content type decides,
//!    and content declared as JSON must parse;
//! 3. otherwise valid UTF-8 becomes text (`auto-detect` also tries JSON,
//!    quietly keeping the text on failure) and anything else stays raw.

use super::message::{InboundMessage, MessageProperties, Payload};
use crate::transport::InboundPacket;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Output type a subscriber asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    Buffer,
    Base64,
    #[default]
    Utf8,
    Json,
    Auto,
    AutoDetect,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Buffer => "buffer",
            DataType::Base64 => "base64",
            DataType::Utf8 => "utf8",
            DataType::Json => "json",
            DataType::Auto => "auto",
            DataType::AutoDetect => "auto-detect",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buffer" => Ok(DataType::Buffer),
            "base64" => Ok(DataType::Base64),
            "utf8" => Ok(DataType::Utf8),
            "json" => Ok(DataType::Json),
            "auto" => Ok(DataType::Auto),
            "auto-detect" => Ok(DataType::AutoDetect),
            other => Err(format!("unknown datatype '{other}'")),
        }
    }
}

/// How a declared media type should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Text,
    Json,
    Binary,
}

/// Look up a content type (case-insensitive). Unknown types return `None`.
pub fn media_kind(content_type: &str) -> Option<MediaKind> {
    let lower = content_type.to_ascii_lowercase();
    match lower.as_str() {
        "text/css" | "text/html" | "text/plain" | "application/xml" => Some(MediaKind::Text),
        "application/json" => Some(MediaKind::Json),
        "application/octet-stream"
        | "application/pdf"
        | "application/x-gtar"
        | "application/x-gzip"
        | "application/x-tar"
        | "application/zip"
        | "audio/aac"
        | "audio/ac3"
        | "audio/basic"
        | "audio/mp4"
        | "audio/ogg"
        | "image/bmp"
        | "image/gif"
        | "image/jpeg"
        | "image/tiff"
        | "image/png" => Some(MediaKind::Binary),
        other if other.starts_with("text/") => Some(MediaKind::Text),
        _ => None,
    }
}

/// Distinct codes for decode failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorCode {
    /// JSON was required but the payload is not UTF-8
    InvalidJsonString,
    /// JSON was required but the payload does not parse
    InvalidJsonParse,
}

impl DecodeErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeErrorCode::InvalidJsonString => "invalid-json-string",
            DecodeErrorCode::InvalidJsonParse => "invalid-json-parse",
        }
    }
}

impl fmt::Display for DecodeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that could not be decoded as requested
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Failed to decode payload on '{topic}': {code}")]
pub struct DecodeError {
    pub code: DecodeErrorCode,
    pub topic: String,
    pub payload: Payload,
    pub qos: u8,
    pub retain: bool,
}

/// Declared payload hints from a v5 PUBLISH
#[derive(Debug, Clone, Copy, Default)]
struct Hints<'a> {
    utf8_declared: bool,
    content_type: Option<&'a str>,
}

/// Decode an inbound packet for a subscriber asking for `datatype`.
///
/// v5 properties are only surfaced when `v5` is set.
pub fn decode_inbound(
    datatype: DataType,
    packet: &InboundPacket,
    v5: bool,
) -> Result<InboundMessage, DecodeError> {
    let properties = match (&packet.properties, v5) {
        (Some(bag), true) => MessageProperties::from_bag(bag),
        _ => MessageProperties::default(),
    };
    let hints = Hints {
        utf8_declared: v5 && properties.payload_format_indicator == Some(true),
        content_type: if v5 {
            properties.content_type.as_deref()
        } else {
            None
        },
    };

    let fail = |code: DecodeErrorCode, payload: Payload| DecodeError {
        code,
        topic: packet.topic.clone(),
        payload,
        qos: packet.qos,
        retain: packet.retain,
    };

    let payload = decode_payload(datatype, &packet.payload, hints)
        .map_err(|(code, payload)| fail(code, payload))?;

    Ok(InboundMessage {
        topic: packet.topic.clone(),
        payload,
        qos: packet.qos,
        retain: packet.retain,
        properties,
    })
}

fn decode_payload(
    datatype: DataType,
    raw: &Bytes,
    hints: Hints<'_>,
) -> Result<Payload, (DecodeErrorCode, Payload)> {
    match datatype {
        DataType::Buffer => Ok(Payload::Bytes(raw.clone())),
        DataType::Base64 => Ok(Payload::Text(BASE64.encode(raw))),
        DataType::Utf8 => Ok(Payload::Text(lossy_text(raw))),
        DataType::Json => {
            if !(hints.utf8_declared || is_utf8(raw)) {
                return Err((
                    DecodeErrorCode::InvalidJsonString,
                    Payload::Bytes(raw.clone()),
                ));
            }
            let text = lossy_text(raw);
            serde_json::from_str(&text)
                .map(Payload::Json)
                .map_err(|_| (DecodeErrorCode::InvalidJsonParse, Payload::Text(text)))
        }
        DataType::Auto | DataType::AutoDetect => {
            let detect = datatype == DataType::AutoDetect;
            if hints.utf8_declared || hints.content_type.is_some() {
                decode_declared(raw, hints, detect)
            } else if is_utf8(raw) {
                Ok(text_or_json(lossy_text(raw), detect))
            } else {
                Ok(Payload::Bytes(raw.clone()))
            }
        }
    }
}

fn decode_declared(
    raw: &Bytes,
    hints: Hints<'_>,
    detect: bool,
) -> Result<Payload, (DecodeErrorCode, Payload)> {
    match hints.content_type.and_then(media_kind) {
        Some(MediaKind::Text) => Ok(Payload::Text(lossy_text(raw))),
        Some(MediaKind::Binary) => Ok(Payload::Bytes(raw.clone())),
        Some(MediaKind::Json) => {
            let text = lossy_text(raw);
            match serde_json::from_str(&text) {
                Ok(value) if detect => Ok(Payload::Json(value)),
                Ok(_) => Ok(Payload::Text(text)),
                Err(_) => Err((DecodeErrorCode::InvalidJsonParse, Payload::Text(text))),
            }
        }
        None => {
            if hints.utf8_declared || is_utf8(raw) {
                Ok(text_or_json(lossy_text(raw), detect))
            } else {
                Ok(Payload::Bytes(raw.clone()))
            }
        }
    }
}

fn text_or_json(text: String, detect: bool) -> Payload {
    if detect {
        if let Ok(value) = serde_json::from_str(&text) {
            return Payload::Json(value);
        }
    }
    Payload::Text(text)
}

fn is_utf8(raw: &[u8]) -> bool {
    std::str::from_utf8(raw).is_ok()
}

fn lossy_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}
