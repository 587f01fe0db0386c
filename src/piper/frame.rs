//! Frame wire format for the Piper.
//!
//! One frame per line. Control tags are a NUL sentinel byte followed by a
//! fixed mnemonic; payloads are JSON objects. serde_json output can never
//! contain a raw newline or begin with NUL, so neither the newline delimiter
//! nor the control tags can collide with a payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const TAG_START: &[u8] = b"\0START";
const TAG_HALT: &[u8] = b"\0HALT";
const TAG_HEARTBEAT: &[u8] = b"\0HEARTBEAT";
const TAG_ERROR: &[u8] = b"\0ERROR";

/// One message on a Piper: a control tag, an application value, or a
/// structured error marshalled from the other side.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T> {
    /// Readiness announcement from the parent; restart request from the child.
    Start,
    /// Orderly shutdown of the child driver.
    Halt,
    /// Liveness round-trip.
    Heartbeat,
    /// Bare error tag (no detail attached).
    Error,
    /// Application payload.
    Value(T),
    /// Structured error from the other side of the fork.
    Fault(WireError),
}

impl<T> Frame<T> {
    /// Frame kind mnemonic, for protocol-violation messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Start => "START",
            Frame::Halt => "HALT",
            Frame::Heartbeat => "HEARTBEAT",
            Frame::Error => "ERROR",
            Frame::Value(_) => "VALUE",
            Frame::Fault(_) => "FAULT",
        }
    }
}

/// An error reduced to what survives the pipe: a stable kind label and the
/// rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Stable snake_case kind label (see [`Error::label`]).
    pub kind: String,
    /// Rendered error message.
    pub message: String,
}

impl WireError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        Self::new(e.label(), e.to_string())
    }
}

impl From<WireError> for Error {
    fn from(w: WireError) -> Self {
        Error::ChildRaised {
            kind: w.kind,
            message: w.message,
        }
    }
}

/// Payload envelope: `{"v": …}` for values, `{"e": …}` for structured errors.
#[derive(Serialize)]
enum EncodeEnvelope<'a, T: Serialize> {
    #[serde(rename = "v")]
    Value(&'a T),
    #[serde(rename = "e")]
    Fault(&'a WireError),
}

#[derive(Deserialize)]
enum DecodeEnvelope<T> {
    #[serde(rename = "v")]
    Value(T),
    #[serde(rename = "e")]
    Fault(WireError),
}

impl<T: Serialize> Frame<T> {
    /// Serialize to one wire line, delimiter included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut line = match self {
            Frame::Start => TAG_START.to_vec(),
            Frame::Halt => TAG_HALT.to_vec(),
            Frame::Heartbeat => TAG_HEARTBEAT.to_vec(),
            Frame::Error => TAG_ERROR.to_vec(),
            Frame::Value(v) => serde_json::to_vec(&EncodeEnvelope::Value(v))?,
            Frame::Fault(e) => serde_json::to_vec(&EncodeEnvelope::<T>::Fault(e))?,
        };
        line.push(b'\n');
        Ok(line)
    }
}

/// Encode one application value as a wire line without taking ownership.
pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&EncodeEnvelope::Value(value))?;
    line.push(b'\n');
    Ok(line)
}

impl<T: DeserializeOwned> Frame<T> {
    /// Deserialize from one wire line (delimiter already stripped).
    pub fn decode(line: &[u8]) -> Result<Self> {
        if line.first() == Some(&0) {
            return match line {
                TAG_START => Ok(Frame::Start),
                TAG_HALT => Ok(Frame::Halt),
                TAG_HEARTBEAT => Ok(Frame::Heartbeat),
                TAG_ERROR => Ok(Frame::Error),
                _ => Err(Error::UnknownSignal(
                    String::from_utf8_lossy(&line[1..]).into_owned(),
                )),
            };
        }
        match serde_json::from_slice(line)? {
            DecodeEnvelope::Value(v) => Ok(Frame::Value(v)),
            DecodeEnvelope::Fault(e) => Ok(Frame::Fault(e)),
        }
    }
}
