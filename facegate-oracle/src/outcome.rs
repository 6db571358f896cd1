use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque resident identifier, shared with the oracle as `resident_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResidentId(String);

impl ResidentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResidentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResidentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Encoded still image. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    bytes: Vec<u8>,
}

impl ImagePayload {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Decode a base64 image, accepting the `data:image/...;base64,` form
    /// produced by browser canvases.
    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        let encoded = encoded.trim();
        let encoded = match encoded.split_once(',') {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => encoded,
        };
        Ok(Self::from_bytes(STANDARD.decode(encoded)?))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImagePayload({} bytes)", self.bytes.len())
    }
}

/// Match strength normalized to [0, 1].
///
/// Values reported outside the range are clamped and remember that they were,
/// so the decision layer can flag the reading as suspect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confidence {
    value: f64,
    clamped: bool,
}

impl Confidence {
    pub const ZERO: Confidence = Confidence {
        value: 0.0,
        clamped: false,
    };

    pub fn new(raw: f64) -> Self {
        if raw.is_nan() {
            return Self {
                value: 0.0,
                clamped: true,
            };
        }
        let value = raw.clamp(0.0, 1.0);
        Self {
            value,
            clamped: value != raw,
        }
    }

    pub fn value(self) -> f64 {
        self.value
    }

    pub fn was_clamped(self) -> bool {
        self.clamped
    }

    /// Meeting the threshold exactly counts as meeting it.
    pub fn meets(self, threshold: f64) -> bool {
        self.value >= threshold
    }
}

/// Dissimilarity reported by the oracle; lower is more similar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distance {
    value: f64,
    clamped: bool,
}

impl Distance {
    pub fn new(raw: f64) -> Self {
        if raw.is_nan() {
            return Self {
                value: f64::INFINITY,
                clamped: true,
            };
        }
        let value = raw.max(0.0);
        Self {
            value,
            clamped: value != raw,
        }
    }

    pub fn value(self) -> f64 {
        self.value
    }

    pub fn was_clamped(self) -> bool {
        self.clamped
    }
}

/// Failure categories shared by every oracle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Transport,
    Timeout,
    ServerFault,
    ClientFault,
    ProtocolMismatch,
    OracleUnavailable,
    Canceled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServerFault => "server fault",
            ErrorKind::ClientFault => "client fault",
            ErrorKind::ProtocolMismatch => "protocol mismatch",
            ErrorKind::OracleUnavailable => "oracle unavailable",
            ErrorKind::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed oracle call.
///
/// `sent` is false only when the request is known not to have left this
/// process (refused connection, connect timeout, local validation). Anything
/// uncertain is reported as sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OracleFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub sent: bool,
}

impl OracleFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>, sent: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            sent,
        }
    }

    pub fn unsent(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, false)
    }
}

/// Result of one recognition call, selected by the request mode.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionOutcome {
    Registered {
        resident_id: ResidentId,
    },
    Matched {
        resident_id: ResidentId,
        confidence: Confidence,
        distance: Option<Distance>,
    },
    NoMatch {
        confidence: Confidence,
    },
    Failed(OracleFailure),
}

impl RecognitionOutcome {
    pub fn failed(kind: ErrorKind, message: impl Into<String>, sent: bool) -> Self {
        RecognitionOutcome::Failed(OracleFailure::new(kind, message, sent))
    }

    pub fn failure(&self) -> Option<&OracleFailure> {
        match self {
            RecognitionOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestMode {
    Register,
    Verify,
    Identify,
    HealthCheck,
}

impl RequestMode {
    /// Reads that can be repeated without changing oracle state.
    pub fn is_idempotent(self) -> bool {
        matches!(self, RequestMode::Identify | RequestMode::HealthCheck)
    }
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestMode::Register => "register",
            RequestMode::Verify => "verify",
            RequestMode::Identify => "identify",
            RequestMode::HealthCheck => "health check",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    pub mode: RequestMode,
    pub resident_id: Option<ResidentId>,
    pub image: Option<ImagePayload>,
}

impl RecognitionRequest {
    pub fn register(resident_id: ResidentId, image: ImagePayload) -> Self {
        Self {
            mode: RequestMode::Register,
            resident_id: Some(resident_id),
            image: Some(image),
        }
    }

    pub fn verify(resident_id: ResidentId, image: ImagePayload) -> Self {
        Self {
            mode: RequestMode::Verify,
            resident_id: Some(resident_id),
            image: Some(image),
        }
    }

    pub fn identify(image: ImagePayload) -> Self {
        Self {
            mode: RequestMode::Identify,
            resident_id: None,
            image: Some(image),
        }
    }

    pub fn health_check() -> Self {
        Self {
            mode: RequestMode::HealthCheck,
            resident_id: None,
            image: None,
        }
    }
}
