//! The on-wire message shape and its codec.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Reserved `target` value meaning "the master itself, not any labelled connection".
pub const MASTER_TARGET: &str = "master";

/// A 128-bit random identifier correlating a request envelope with its reply or
/// replies. Serialized as a fixed-width lowercase hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u128);

impl RequestId {
    /// Draw a new id from the OS RNG.
    #[inline]
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <&str>::deserialize(deserializer)?;
        u128::from_str_radix(raw, 16)
            .map(RequestId)
            .map_err(|e| serde::de::Error::custom(format!("invalid request id: {e}")))
    }
}

/// The fixed-shape wrapper every frame on the bus is carried in, once past the
/// handshake. See [`crate::auth::AuthFrame`] for the handshake's own smaller shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name. The `ipc_` prefix is reserved for bus-internal events.
    #[serde(rename = "type")]
    pub kind: String,
    /// Caller-defined payload, opaque to the router.
    #[serde(default)]
    pub data: serde_json::Value,
    /// `None` means broadcast, `Some("master")` addresses the master itself, anything
    /// else addresses every connection currently advertising that label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Present on a reply: the id of the request it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<RequestId>,
    /// Present on a request: the id its reply(s) must echo back as `response_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Master-stamped label of the connection that originated the envelope. Absent on
    /// envelopes a worker sends upstream; always present once the master has relayed
    /// or broadcast it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl Envelope {
    pub fn event(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self { kind: kind.into(), data, target: None, response_id: None, request_id: None, from: None }
    }

    /// Which connections this envelope addresses.
    pub fn target_kind(&self) -> TargetKind<'_> {
        match self.target.as_deref() {
            None => TargetKind::Broadcast,
            Some(MASTER_TARGET) => TargetKind::Master,
            Some(label) => TargetKind::Label(label),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind<'a> {
    Broadcast,
    Master,
    Label(&'a str),
}

/// Encode an envelope to the text frame that goes over the wire.
///
/// With the `fast-codec` feature, this always produces `simd-json`'s output; the
/// fallback to `serde_json` only matters on the decode side, since encoding a value we
/// just built cannot fail the way parsing attacker-controlled bytes can.
pub fn encode(envelope: &Envelope) -> Result<String, Error> {
    #[cfg(feature = "fast-codec")]
    {
        if let Ok(bytes) = simd_json::to_vec(envelope) {
            if let Ok(text) = String::from_utf8(bytes) {
                return Ok(text);
            }
        }
    }
    serde_json::to_string(envelope).map_err(|e| Error::BadEnvelope(e.to_string()))
}

/// Decode a text frame into an envelope, trying the SIMD-accelerated parser first
/// when `fast-codec` is enabled and falling back to the standard one on any failure.
pub fn decode(text: &str) -> Result<Envelope, Error> {
    #[cfg(feature = "fast-codec")]
    {
        let mut scratch = text.as_bytes().to_vec();
        match simd_json::serde::from_slice::<Envelope>(&mut scratch) {
            Ok(envelope) => return Ok(envelope),
            Err(e) => tracing::debug!(error = %e, "fast-codec rejected envelope, falling back"),
        }
    }
    serde_json::from_str(text).map_err(|e| Error::BadEnvelope(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_roundtrips_through_json() {
        let id = RequestId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn envelope_roundtrips_with_minimal_fields() {
        let envelope = Envelope::event("ping", serde_json::json!({"n": 1}));
        let text = encode(&envelope).unwrap();
        let back = decode(&text).unwrap();
        assert_eq!(back.kind, "ping");
        assert_eq!(back.target, None);
        assert_eq!(back.data, serde_json::json!({"n": 1}));
    }

    #[test]
    fn target_kind_classifies_correctly() {
        let mut e = Envelope::event("x", serde_json::Value::Null);
        assert_eq!(e.target_kind(), TargetKind::Broadcast);
        e.target = Some(MASTER_TARGET.to_string());
        assert_eq!(e.target_kind(), TargetKind::Master);
        e.target = Some("renderer".to_string());
        assert_eq!(e.target_kind(), TargetKind::Label("renderer"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode("not json").is_err());
    }
}
