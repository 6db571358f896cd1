//! Access decision engine.
//!
//! [`decide`] turns a recognition outcome into an [`AccessDecision`]. It does
//! no I/O, so the same outcome and thresholds always produce the same verdict.

use chrono::{DateTime, Utc};
use facegate_oracle::{ErrorKind, RecognitionOutcome, RequestMode, ResidentId};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::residents::Resident;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Granted,
    Denied,
    /// The oracle could not give a usable answer. Physical access stays
    /// closed, but the entry is told apart from a real denial.
    Inconclusive,
    /// Enrollment succeeded; neither a grant nor a denial.
    Enrolled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Granted => "GRANTED",
            Outcome::Denied => "DENIED",
            Outcome::Inconclusive => "INCONCLUSIVE",
            Outcome::Enrolled => "ENROLLED",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    Matched,
    Enrolled,
    LowConfidenceDenied,
    IdentityMismatchDenied,
    UnknownPerson,
    ResidentUnknown,
    ResidentInactive,
    SystemError(ErrorKind),
    EnrollmentFailed(ErrorKind),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Matched => f.write_str("matched"),
            Reason::Enrolled => f.write_str("enrolled"),
            Reason::LowConfidenceDenied => f.write_str("low confidence"),
            Reason::IdentityMismatchDenied => f.write_str("identity mismatch"),
            Reason::UnknownPerson => f.write_str("unknown person"),
            Reason::ResidentUnknown => f.write_str("resident not on file"),
            Reason::ResidentInactive => f.write_str("resident inactive"),
            Reason::SystemError(kind) => write!(f, "system error ({kind})"),
            Reason::EnrollmentFailed(kind) => write!(f, "enrollment failed ({kind})"),
        }
    }
}

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Register { resident_id: ResidentId },
    Verify { claimed: ResidentId },
    Identify,
}

impl Mode {
    pub fn request_mode(&self) -> RequestMode {
        match self {
            Mode::Register { .. } => RequestMode::Register,
            Mode::Verify { .. } => RequestMode::Verify,
            Mode::Identify => RequestMode::Identify,
        }
    }

    fn subject(&self) -> Option<&ResidentId> {
        match self {
            Mode::Register { resident_id } => Some(resident_id),
            Mode::Verify { claimed } => Some(claimed),
            Mode::Identify => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Minimum confidence to grant; meeting it exactly is enough.
    pub confidence: f64,
    /// Optional second axis: matches farther than this are denied.
    pub max_distance: Option<f64>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence: 0.6,
            max_distance: None,
        }
    }
}

/// Immutable verdict for one access attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    mode: RequestMode,
    outcome: Outcome,
    resident_id: Option<ResidentId>,
    confidence: f64,
    distance: Option<f64>,
    reason: Reason,
    detail: String,
    data_quality: bool,
    timestamp: DateTime<Utc>,
}

impl AccessDecision {
    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn resident_id(&self) -> Option<&ResidentId> {
        self.resident_id.as_ref()
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn distance(&self) -> Option<f64> {
        self.distance
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// Human readable explanation, suitable for display.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Set when the oracle reported an out-of-range score that was clamped.
    pub fn data_quality(&self) -> bool {
        self.data_quality
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_granted(&self) -> bool {
        self.outcome == Outcome::Granted
    }

    /// A new denial for the same attempt, keeping its scores and time.
    fn denied(&self, reason: Reason, detail: String) -> AccessDecision {
        AccessDecision {
            outcome: Outcome::Denied,
            reason,
            detail,
            ..self.clone()
        }
    }
}

pub fn decide(mode: &Mode, outcome: &RecognitionOutcome, thresholds: &Thresholds) -> AccessDecision {
    decide_at(mode, outcome, thresholds, Utc::now())
}

pub fn decide_at(
    mode: &Mode,
    outcome: &RecognitionOutcome,
    thresholds: &Thresholds,
    timestamp: DateTime<Utc>,
) -> AccessDecision {
    let base = AccessDecision {
        mode: mode.request_mode(),
        outcome: Outcome::Denied,
        resident_id: mode.subject().cloned(),
        confidence: 0.0,
        distance: None,
        reason: Reason::UnknownPerson,
        detail: String::new(),
        data_quality: false,
        timestamp,
    };

    match (mode, outcome) {
        (_, RecognitionOutcome::Failed(failure)) => {
            let (reason, detail) = match mode {
                Mode::Register { .. } => (
                    Reason::EnrollmentFailed(failure.kind),
                    format!("enrollment failed: {failure}"),
                ),
                _ => (
                    Reason::SystemError(failure.kind),
                    format!("oracle failure, access stays closed: {failure}"),
                ),
            };
            AccessDecision {
                outcome: Outcome::Inconclusive,
                reason,
                detail,
                ..base
            }
        }

        (Mode::Register { resident_id }, RecognitionOutcome::Registered { resident_id: enrolled })
            if enrolled == resident_id =>
        {
            AccessDecision {
                outcome: Outcome::Enrolled,
                confidence: 1.0,
                reason: Reason::Enrolled,
                detail: format!("face enrolled for {resident_id}"),
                ..base
            }
        }

        (
            Mode::Verify { claimed },
            RecognitionOutcome::Matched {
                resident_id,
                confidence,
                ..
            },
        ) if resident_id != claimed => {
            AccessDecision {
                confidence: confidence.value(),
                data_quality: confidence.was_clamped(),
                reason: Reason::IdentityMismatchDenied,
                detail: format!("face does not belong to {claimed}"),
                ..base
            }
        }

        (
            Mode::Verify { .. } | Mode::Identify,
            RecognitionOutcome::Matched {
                resident_id,
                confidence,
                distance,
            },
        ) => {
            let data_quality =
                confidence.was_clamped() || distance.map_or(false, |d| d.was_clamped());
            let decision = AccessDecision {
                confidence: confidence.value(),
                distance: distance.map(|d| d.value()),
                data_quality,
                ..base
            };

            if !confidence.meets(thresholds.confidence) {
                return AccessDecision {
                    reason: Reason::LowConfidenceDenied,
                    detail: format!(
                        "confidence {:.2} below threshold {:.2}",
                        confidence.value(),
                        thresholds.confidence
                    ),
                    ..decision
                };
            }
            if let (Some(max), Some(d)) = (thresholds.max_distance, distance) {
                if d.value() > max {
                    return AccessDecision {
                        reason: Reason::LowConfidenceDenied,
                        detail: format!("distance {:.3} above limit {max:.3}", d.value()),
                        ..decision
                    };
                }
            }
            AccessDecision {
                outcome: Outcome::Granted,
                resident_id: Some(resident_id.clone()),
                reason: Reason::Matched,
                detail: format!(
                    "access granted for {resident_id} (confidence {:.2})",
                    confidence.value()
                ),
                ..decision
            }
        }

        (Mode::Verify { claimed }, RecognitionOutcome::NoMatch { confidence }) => AccessDecision {
            confidence: confidence.value(),
            data_quality: confidence.was_clamped(),
            reason: Reason::IdentityMismatchDenied,
            detail: format!("face not recognized as {claimed}"),
            ..base
        },

        (Mode::Identify, RecognitionOutcome::NoMatch { confidence }) => AccessDecision {
            confidence: confidence.value(),
            data_quality: confidence.was_clamped(),
            reason: Reason::UnknownPerson,
            detail: "face not recognized".to_string(),
            ..base
        },

        // Any other pairing means the client answered a different question.
        _ => AccessDecision {
            outcome: Outcome::Inconclusive,
            reason: Reason::SystemError(ErrorKind::ProtocolMismatch),
            detail: format!("unexpected {} outcome: {outcome:?}", mode.request_mode()),
            ..base
        },
    }
}

/// Grants require the resident to be on file and active.
pub fn apply_resident_policy(decision: AccessDecision, resident: Option<&Resident>) -> AccessDecision {
    if !decision.is_granted() {
        return decision;
    }
    match resident {
        None => {
            let id = decision.resident_id().map(ToString::to_string).unwrap_or_default();
            decision.denied(
                Reason::ResidentUnknown,
                format!("face recognized as {id} but no resident record is on file"),
            )
        }
        Some(resident) if !resident.active => decision.denied(
            Reason::ResidentInactive,
            format!("resident {} is deactivated", resident.id),
        ),
        Some(_) => decision,
    }
}

/// Refusal recorded when enrollment is rejected before reaching the oracle.
pub fn refuse_enrollment(resident_id: &ResidentId, resident: Option<&Resident>) -> Option<AccessDecision> {
    let (reason, detail) = match resident {
        None => (
            Reason::ResidentUnknown,
            format!("no resident record for {resident_id}"),
        ),
        Some(r) if !r.active => (
            Reason::ResidentInactive,
            format!("resident {resident_id} is deactivated"),
        ),
        Some(_) => return None,
    };
    Some(AccessDecision {
        mode: RequestMode::Register,
        outcome: Outcome::Denied,
        resident_id: Some(resident_id.clone()),
        confidence: 0.0,
        distance: None,
        reason,
        detail,
        data_quality: false,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_oracle::{Confidence, Distance};

    fn matched(id: &str, confidence: f64) -> RecognitionOutcome {
        RecognitionOutcome::Matched {
            resident_id: ResidentId::from(id),
            confidence: Confidence::new(confidence),
            distance: Some(Distance::new(1.0 - confidence)),
        }
    }

    fn verify(id: &str) -> Mode {
        Mode::Verify {
            claimed: ResidentId::from(id),
        }
    }

    fn thresholds(t: f64) -> Thresholds {
        Thresholds {
            confidence: t,
            max_distance: None,
        }
    }

    fn failures() -> Vec<RecognitionOutcome> {
        [
            ErrorKind::Transport,
            ErrorKind::Timeout,
            ErrorKind::ServerFault,
            ErrorKind::ClientFault,
            ErrorKind::ProtocolMismatch,
            ErrorKind::OracleUnavailable,
            ErrorKind::Canceled,
        ]
        .into_iter()
        .map(|kind| RecognitionOutcome::failed(kind, "boom", true))
        .collect()
    }

    #[test]
    fn test_verify_grants_iff_confidence_meets_threshold() {
        let steps = [0.0, 0.25, 0.5, 0.59, 0.6, 0.61, 0.82, 1.0];
        for &c in &steps {
            for &t in &steps {
                let d = decide(&verify("R1"), &matched("R1", c), &thresholds(t));
                assert_eq!(d.is_granted(), c >= t, "c={c} t={t}");
                if !d.is_granted() {
                    assert_eq!(d.reason(), Reason::LowConfidenceDenied);
                }
            }
        }
    }

    #[test]
    fn test_verify_other_identity_always_denied() {
        for c in [0.0, 0.6, 0.99, 1.0] {
            let d = decide(&verify("R2"), &matched("R1", c), &thresholds(0.0));
            assert_eq!(d.outcome(), Outcome::Denied);
            assert_eq!(d.reason(), Reason::IdentityMismatchDenied);
            assert_eq!(d.resident_id().map(|r| r.as_str()), Some("R2"));
        }
    }

    #[test]
    fn test_failures_never_grant() {
        let modes = [
            Mode::Register {
                resident_id: ResidentId::from("R1"),
            },
            verify("R1"),
            Mode::Identify,
        ];
        for mode in &modes {
            for outcome in failures() {
                let d = decide(mode, &outcome, &thresholds(0.0));
                assert_eq!(d.outcome(), Outcome::Inconclusive);
                assert!(!d.is_granted());
            }
        }
    }

    #[test]
    fn test_register_failure_is_enrollment_failure() {
        let mode = Mode::Register {
            resident_id: ResidentId::from("R1"),
        };
        let d = decide(
            &mode,
            &RecognitionOutcome::failed(ErrorKind::ClientFault, "No face detected", true),
            &thresholds(0.6),
        );
        assert_eq!(d.reason(), Reason::EnrollmentFailed(ErrorKind::ClientFault));
        assert!(d.detail().contains("No face detected"));
    }

    #[test]
    fn test_register_success_is_informational() {
        let mode = Mode::Register {
            resident_id: ResidentId::from("R1"),
        };
        let d = decide(
            &mode,
            &RecognitionOutcome::Registered {
                resident_id: ResidentId::from("R1"),
            },
            &thresholds(0.6),
        );
        assert_eq!(d.outcome(), Outcome::Enrolled);
        assert!(!d.is_granted());
    }

    #[test]
    fn test_scenarios() {
        let t = thresholds(0.6);

        let d = decide(&verify("R1"), &matched("R1", 0.82), &t);
        assert_eq!(d.outcome(), Outcome::Granted);
        assert_eq!(d.confidence(), 0.82);

        let d = decide(&verify("R2"), &matched("R1", 0.82), &t);
        assert_eq!(d.outcome(), Outcome::Denied);
        assert_eq!(d.reason(), Reason::IdentityMismatchDenied);

        let d = decide(&verify("R1"), &matched("R1", 0.4), &t);
        assert_eq!(d.outcome(), Outcome::Denied);
        assert_eq!(d.reason(), Reason::LowConfidenceDenied);
    }

    #[test]
    fn test_identify() {
        let t = thresholds(0.6);

        let d = decide(&Mode::Identify, &matched("R7", 0.9), &t);
        assert!(d.is_granted());
        assert_eq!(d.resident_id().map(|r| r.as_str()), Some("R7"));

        let d = decide(&Mode::Identify, &matched("R7", 0.3), &t);
        assert_eq!(d.outcome(), Outcome::Denied);
        assert_eq!(d.resident_id(), None);

        let d = decide(
            &Mode::Identify,
            &RecognitionOutcome::NoMatch {
                confidence: Confidence::new(0.2),
            },
            &t,
        );
        assert_eq!(d.reason(), Reason::UnknownPerson);
        assert_eq!(d.confidence(), 0.2);
    }

    #[test]
    fn test_distance_axis_when_configured() {
        let t = Thresholds {
            confidence: 0.6,
            max_distance: Some(0.3),
        };
        let near = RecognitionOutcome::Matched {
            resident_id: ResidentId::from("R1"),
            confidence: Confidence::new(0.8),
            distance: Some(Distance::new(0.2)),
        };
        let far = RecognitionOutcome::Matched {
            resident_id: ResidentId::from("R1"),
            confidence: Confidence::new(0.8),
            distance: Some(Distance::new(0.45)),
        };
        assert!(decide(&verify("R1"), &near, &t).is_granted());
        let d = decide(&verify("R1"), &far, &t);
        assert_eq!(d.reason(), Reason::LowConfidenceDenied);
        assert!(!d.is_granted());
    }

    #[test]
    fn test_clamped_confidence_is_flagged() {
        let d = decide(&verify("R1"), &matched("R1", 1.3), &thresholds(0.6));
        assert!(d.data_quality());
        assert_eq!(d.confidence(), 1.0);
    }

    #[test]
    fn test_mismatched_outcome_fails_closed() {
        let d = decide(
            &Mode::Identify,
            &RecognitionOutcome::Registered {
                resident_id: ResidentId::from("R1"),
            },
            &thresholds(0.0),
        );
        assert_eq!(d.outcome(), Outcome::Inconclusive);
    }

    #[test]
    fn test_decide_at_is_deterministic() {
        let at = Utc::now();
        let a = decide_at(&verify("R1"), &matched("R1", 0.7), &thresholds(0.6), at);
        let b = decide_at(&verify("R1"), &matched("R1", 0.7), &thresholds(0.6), at);
        assert_eq!(a, b);
    }

    #[test]
    fn test_resident_policy() {
        let grant = decide(&verify("R1"), &matched("R1", 0.9), &thresholds(0.6));

        let d = apply_resident_policy(grant.clone(), None);
        assert_eq!(d.reason(), Reason::ResidentUnknown);
        assert!(!d.is_granted());

        let inactive = Resident {
            id: ResidentId::from("R1"),
            name: "Ana Torres".into(),
            apartment: "4B".into(),
            active: false,
        };
        let d = apply_resident_policy(grant.clone(), Some(&inactive));
        assert_eq!(d.reason(), Reason::ResidentInactive);
        assert_eq!(d.confidence(), 0.9);

        let active = Resident {
            active: true,
            ..inactive
        };
        assert!(apply_resident_policy(grant, Some(&active)).is_granted());
    }
}
