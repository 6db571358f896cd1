use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cancel::CallContext;
use crate::outcome::{
    Confidence, Distance, ErrorKind, ImagePayload, OracleFailure, RecognitionOutcome,
    RecognitionRequest, RequestMode, ResidentId,
};
use crate::wire::{
    RecognizeFaceRequest, RecognizeFaceResponse, RegisterFaceRequest, RegisterFaceResponse,
    HEALTH_PATH, RECOGNIZE_PATH, REGISTER_PATH,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Access to the external recognition oracle.
///
/// Failures never escape as errors: they come back as
/// [`RecognitionOutcome::Failed`] so every call ends in an auditable outcome.
#[async_trait]
pub trait RecognitionClient: Send + Sync {
    /// Enroll (or replace) the template for `resident_id`.
    async fn register(
        &self,
        resident_id: &ResidentId,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> RecognitionOutcome;

    /// Match `image` against the claimed resident only.
    async fn verify(
        &self,
        resident_id: &ResidentId,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> RecognitionOutcome;

    /// Open-set search over every enrolled resident.
    async fn identify(&self, image: &ImagePayload, ctx: &CallContext) -> RecognitionOutcome;

    async fn health_check(&self, ctx: &CallContext) -> bool;
}

#[async_trait]
impl<C: RecognitionClient + ?Sized> RecognitionClient for Arc<C> {
    async fn register(
        &self,
        resident_id: &ResidentId,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> RecognitionOutcome {
        (**self).register(resident_id, image, ctx).await
    }

    async fn verify(
        &self,
        resident_id: &ResidentId,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> RecognitionOutcome {
        (**self).verify(resident_id, image, ctx).await
    }

    async fn identify(&self, image: &ImagePayload, ctx: &CallContext) -> RecognitionOutcome {
        (**self).identify(image, ctx).await
    }

    async fn health_check(&self, ctx: &CallContext) -> bool {
        (**self).health_check(ctx).await
    }
}

/// Oracle client speaking the `/register_face`, `/recognize_face`, `/health`
/// JSON contract.
pub struct HttpRecognitionClient {
    http: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpRecognitionClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        // Trailing slash so endpoint joins keep any path prefix.
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .with_context(|| format!("parsing oracle url {base_url}"))?;
        // Connect failures must surface as reqwest connect errors so they are
        // known not to have reached the oracle.
        let http = Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, OracleFailure> {
        self.base_url.join(path.trim_start_matches('/')).map_err(|e| {
            OracleFailure::unsent(ErrorKind::ClientFault, format!("bad endpoint {path}: {e}"))
        })
    }

    fn build(&self, request: &RecognitionRequest) -> Result<RequestBuilder, OracleFailure> {
        let image = || {
            request
                .image
                .as_ref()
                .filter(|img| !img.is_empty())
                .ok_or_else(|| OracleFailure::unsent(ErrorKind::ClientFault, "empty face image"))
        };

        let builder = match request.mode {
            RequestMode::Register => {
                let resident_id = request.resident_id.as_ref().ok_or_else(|| {
                    OracleFailure::unsent(ErrorKind::ClientFault, "register without resident id")
                })?;
                let body = RegisterFaceRequest {
                    resident_id: resident_id.as_str(),
                    face_image: image()?.to_base64(),
                };
                self.http.post(self.endpoint(REGISTER_PATH)?).json(&body)
            }
            RequestMode::Verify | RequestMode::Identify => {
                let body = RecognizeFaceRequest {
                    face_image: image()?.to_base64(),
                };
                self.http.post(self.endpoint(RECOGNIZE_PATH)?).json(&body)
            }
            RequestMode::HealthCheck => self.http.get(self.endpoint(HEALTH_PATH)?),
        };
        Ok(builder)
    }

    /// Send one request, bounded by the caller's deadline, the configured
    /// timeout and the cancellation signal.
    async fn dispatch(
        &self,
        request: &RecognitionRequest,
        ctx: &CallContext,
    ) -> Result<(StatusCode, Vec<u8>), OracleFailure> {
        if ctx.cancel.is_cancelled() {
            return Err(OracleFailure::unsent(
                ErrorKind::Canceled,
                "call canceled before sending",
            ));
        }
        let deadline = ctx.effective_deadline(self.timeout);
        if deadline <= Instant::now() {
            return Err(OracleFailure::unsent(
                ErrorKind::Timeout,
                "deadline passed before sending",
            ));
        }

        let builder = self.build(request)?;
        debug!("oracle {} request to {}", request.mode, self.base_url);
        let started = Instant::now();

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body.to_vec()))
        };

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(OracleFailure::new(
                ErrorKind::Canceled,
                "call canceled while in flight",
                true,
            )),
            result = tokio::time::timeout_at(deadline, exchange) => match result {
                Err(_) => {
                    let message = if ctx.deadline == Some(deadline) {
                        format!("caller deadline passed after {:?} in flight", started.elapsed())
                    } else {
                        format!("no response from oracle within {:?}", self.timeout)
                    };
                    Err(OracleFailure::new(ErrorKind::Timeout, message, true))
                }
                Ok(Err(e)) => Err(failure_from_reqwest(&e)),
                Ok(Ok(pair)) => Ok(pair),
            },
        }
    }

    async fn exchange<T: DeserializeOwned>(
        &self,
        request: &RecognitionRequest,
        ctx: &CallContext,
    ) -> Result<T, OracleFailure> {
        let (status, body) = self.dispatch(request, ctx).await?;
        parse_body(status, &body)
    }

    async fn recognize(
        &self,
        request: &RecognitionRequest,
        ctx: &CallContext,
    ) -> Result<Recognition, OracleFailure> {
        let resp: RecognizeFaceResponse = self.exchange(request, ctx).await?;
        interpret_recognition(resp)
    }
}

#[async_trait]
impl RecognitionClient for HttpRecognitionClient {
    async fn register(
        &self,
        resident_id: &ResidentId,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> RecognitionOutcome {
        let request = RecognitionRequest::register(resident_id.clone(), image.clone());
        match self.exchange::<RegisterFaceResponse>(&request, ctx).await {
            Ok(resp) if resp.success => RecognitionOutcome::Registered {
                resident_id: resident_id.clone(),
            },
            Ok(resp) => RecognitionOutcome::failed(
                ErrorKind::ClientFault,
                resp.error
                    .unwrap_or_else(|| "oracle rejected enrollment".to_string()),
                true,
            ),
            Err(failure) => RecognitionOutcome::Failed(failure),
        }
    }

    async fn verify(
        &self,
        resident_id: &ResidentId,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> RecognitionOutcome {
        let request = RecognitionRequest::verify(resident_id.clone(), image.clone());
        match self.recognize(&request, ctx).await {
            Ok(Recognition::Face {
                resident_id: found,
                confidence,
                distance,
            }) => {
                if &found == resident_id {
                    RecognitionOutcome::Matched {
                        resident_id: found,
                        confidence,
                        distance,
                    }
                } else {
                    debug!("claimed identity {resident_id} not confirmed by oracle");
                    RecognitionOutcome::NoMatch { confidence }
                }
            }
            Ok(Recognition::NoFace { confidence }) => RecognitionOutcome::NoMatch { confidence },
            Err(failure) => RecognitionOutcome::Failed(failure),
        }
    }

    async fn identify(&self, image: &ImagePayload, ctx: &CallContext) -> RecognitionOutcome {
        let request = RecognitionRequest::identify(image.clone());
        match self.recognize(&request, ctx).await {
            Ok(Recognition::Face {
                resident_id,
                confidence,
                distance,
            }) => RecognitionOutcome::Matched {
                resident_id,
                confidence,
                distance,
            },
            Ok(Recognition::NoFace { confidence }) => RecognitionOutcome::NoMatch { confidence },
            Err(failure) => RecognitionOutcome::Failed(failure),
        }
    }

    async fn health_check(&self, ctx: &CallContext) -> bool {
        match self.dispatch(&RecognitionRequest::health_check(), ctx).await {
            Ok((status, _)) if status == StatusCode::OK => true,
            Ok((status, _)) => {
                debug!("oracle health check returned {status}");
                false
            }
            Err(failure) => {
                debug!("oracle health check failed: {failure}");
                false
            }
        }
    }
}

/// A successfully parsed `/recognize_face` answer.
enum Recognition {
    Face {
        resident_id: ResidentId,
        confidence: Confidence,
        distance: Option<Distance>,
    },
    NoFace {
        confidence: Confidence,
    },
}

fn interpret_recognition(resp: RecognizeFaceResponse) -> Result<Recognition, OracleFailure> {
    if !resp.success {
        return Err(OracleFailure::new(
            ErrorKind::ClientFault,
            resp.error
                .unwrap_or_else(|| "oracle could not process the image".to_string()),
            true,
        ));
    }

    let confidence = checked_confidence(resp.confidence.unwrap_or(0.0));
    if !resp.recognized.unwrap_or(false) {
        return Ok(Recognition::NoFace { confidence });
    }

    let resident_id = match resp.resident_id {
        Some(id) if !id.is_empty() => ResidentId::from(id),
        _ => {
            return Err(OracleFailure::new(
                ErrorKind::ProtocolMismatch,
                "recognized face without resident_id",
                true,
            ))
        }
    };
    if resp.confidence.is_none() {
        return Err(OracleFailure::new(
            ErrorKind::ProtocolMismatch,
            "recognized face without confidence",
            true,
        ));
    }

    let distance = resp.distance.map(|raw| {
        let distance = Distance::new(raw);
        if distance.was_clamped() {
            warn!("oracle reported distance {raw} outside [0, inf), clamped");
        }
        distance
    });

    Ok(Recognition::Face {
        resident_id,
        confidence,
        distance,
    })
}

fn checked_confidence(raw: f64) -> Confidence {
    let confidence = Confidence::new(raw);
    if confidence.was_clamped() {
        warn!(
            "oracle reported confidence {raw} outside [0, 1], clamped to {}",
            confidence.value()
        );
    }
    confidence
}

fn parse_body<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, OracleFailure> {
    if status.is_server_error() {
        return Err(OracleFailure::new(
            ErrorKind::ServerFault,
            format!("oracle returned {status}: {}", snippet(body)),
            true,
        ));
    }
    if status.is_client_error() {
        return Err(OracleFailure::new(
            ErrorKind::ClientFault,
            format!("oracle returned {status}: {}", snippet(body)),
            true,
        ));
    }
    if !status.is_success() {
        return Err(OracleFailure::new(
            ErrorKind::ProtocolMismatch,
            format!("unexpected oracle status {status}"),
            true,
        ));
    }
    serde_json::from_slice(body).map_err(|e| {
        OracleFailure::new(
            ErrorKind::ProtocolMismatch,
            format!("malformed oracle response: {e}"),
            true,
        )
    })
}

fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(200) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn failure_from_reqwest(err: &reqwest::Error) -> OracleFailure {
    let message = err.to_string();
    if err.is_timeout() {
        // A connect timeout never wrote the request.
        OracleFailure::new(ErrorKind::Timeout, message, !err.is_connect())
    } else if err.is_connect() {
        OracleFailure::unsent(ErrorKind::Transport, message)
    } else if err.is_builder() {
        OracleFailure::unsent(ErrorKind::ClientFault, message)
    } else if err.is_decode() {
        OracleFailure::new(ErrorKind::ProtocolMismatch, message, true)
    } else {
        OracleFailure::new(ErrorKind::Transport, message, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognized(id: &str, confidence: f64) -> RecognizeFaceResponse {
        RecognizeFaceResponse {
            success: true,
            recognized: Some(true),
            resident_id: Some(id.to_string()),
            confidence: Some(confidence),
            distance: Some(1.0 - confidence),
            error: None,
        }
    }

    #[test]
    fn test_status_classification() {
        let err = parse_body::<RegisterFaceResponse>(StatusCode::BAD_GATEWAY, b"upstream")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerFault);

        let err = parse_body::<RegisterFaceResponse>(StatusCode::UNPROCESSABLE_ENTITY, b"{}")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ClientFault);

        let err = parse_body::<RegisterFaceResponse>(StatusCode::OK, b"<html>").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolMismatch);

        let ok = parse_body::<RegisterFaceResponse>(StatusCode::OK, br#"{"success":true}"#)
            .unwrap();
        assert!(ok.success);
    }

    #[test]
    fn test_recognized_face_is_interpreted() {
        match interpret_recognition(recognized("R1", 0.82)) {
            Ok(Recognition::Face {
                resident_id,
                confidence,
                distance,
            }) => {
                assert_eq!(resident_id.as_str(), "R1");
                assert_eq!(confidence.value(), 0.82);
                assert!(distance.is_some());
            }
            _ => panic!("expected a face"),
        }
    }

    #[test]
    fn test_recognized_without_id_is_protocol_mismatch() {
        let mut resp = recognized("R1", 0.9);
        resp.resident_id = None;
        let err = interpret_recognition(resp).err().unwrap();
        assert_eq!(err.kind, ErrorKind::ProtocolMismatch);
    }

    #[test]
    fn test_oracle_rejection_is_client_fault() {
        let resp = RecognizeFaceResponse {
            success: false,
            recognized: None,
            resident_id: None,
            confidence: None,
            distance: None,
            error: Some("Invalid image format".to_string()),
        };
        let err = interpret_recognition(resp).err().unwrap();
        assert_eq!(err.kind, ErrorKind::ClientFault);
        assert_eq!(err.message, "Invalid image format");
    }

    #[test]
    fn test_out_of_range_confidence_is_clamped() {
        match interpret_recognition(recognized("R1", 1.4)) {
            Ok(Recognition::Face { confidence, .. }) => {
                assert_eq!(confidence.value(), 1.0);
                assert!(confidence.was_clamped());
            }
            _ => panic!("expected a face"),
        }
    }

    #[test]
    fn test_snippet_truncates_long_bodies() {
        let long = "x".repeat(500);
        let s = snippet(long.as_bytes());
        assert_eq!(s.len(), 203);
        assert!(s.ends_with("..."));
    }

    #[test]
    fn test_rejects_unparseable_base_url() {
        assert!(HttpRecognitionClient::new("not a url", DEFAULT_TIMEOUT).is_err());
    }

    #[test]
    fn test_endpoint_keeps_path_prefix() {
        let client = HttpRecognitionClient::new("http://oracle.local/api/", DEFAULT_TIMEOUT)
            .unwrap();
        let url = client.endpoint(RECOGNIZE_PATH).unwrap();
        assert_eq!(url.as_str(), "http://oracle.local/api/recognize_face");
    }
}
