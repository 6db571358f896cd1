use anyhow::{Context, Result};
use facegate_oracle::{
    CallContext, HttpRecognitionClient, ImagePayload, RecognitionClient, RequestMode, ResidentId,
};
use log::{error, info, warn};
use std::sync::Arc;

use crate::classifier::Retrying;
use crate::config::Config;
use crate::decision::{
    apply_resident_policy, decide, refuse_enrollment, AccessDecision, Mode, Outcome, Thresholds,
};
use crate::ledger::{AccessLogEntry, AuditLedger, FileLedger, LedgerError};
use crate::residents::{Resident, ResidentDirectory, Roster};

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The decision was made but could not be recorded. The decision is handed
    /// back so the caller still fails closed on it.
    #[error("audit ledger rejected {} decision: {source}", .decision.outcome())]
    Audit {
        decision: Box<AccessDecision>,
        #[source]
        source: LedgerError,
    },
}

/// What the UI receives for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceResult {
    /// Verify: identity confirmed. Register: face enrolled.
    pub verified: bool,
    /// Identify: someone was recognized and admitted.
    pub found: bool,
    pub resident_id: Option<ResidentId>,
    pub confidence: f64,
    pub error: Option<String>,
    pub decision: AccessDecision,
}

impl FaceResult {
    fn from_decision(decision: AccessDecision) -> Self {
        let identify = decision.mode() == RequestMode::Identify;
        let verified = match decision.outcome() {
            Outcome::Granted => !identify,
            Outcome::Enrolled => true,
            _ => false,
        };
        let found = identify && decision.is_granted();
        let error = match decision.outcome() {
            Outcome::Inconclusive => Some(decision.detail().to_string()),
            _ => None,
        };
        Self {
            verified,
            found,
            resident_id: decision.resident_id().cloned(),
            confidence: decision.confidence(),
            error,
            decision,
        }
    }
}

/// Runs one access attempt end to end: oracle call, decision, resident
/// policy, audit.
pub struct AccessGate {
    client: Box<dyn RecognitionClient>,
    ledger: Arc<dyn AuditLedger>,
    directory: Arc<dyn ResidentDirectory>,
    thresholds: Thresholds,
    access_point: String,
}

impl AccessGate {
    pub fn new(
        client: impl RecognitionClient + 'static,
        ledger: Arc<dyn AuditLedger>,
        directory: Arc<dyn ResidentDirectory>,
        thresholds: Thresholds,
        access_point: impl Into<String>,
    ) -> Self {
        Self {
            client: Box::new(client),
            ledger,
            directory,
            thresholds,
            access_point: access_point.into(),
        }
    }

    /// HTTP oracle client with retries, file ledger and roster, all from
    /// configuration.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        cfg.validate()?;
        let http = HttpRecognitionClient::new(&cfg.oracle_url, cfg.timeout())
            .context("creating oracle client")?;
        let ledger = FileLedger::open(&cfg.ledger_path)
            .with_context(|| format!("opening ledger {}", cfg.ledger_path.display()))?;
        let roster = Roster::load(&cfg.residents_path)?;
        info!(
            "gate ready: oracle {}, {} residents, threshold {:.2}",
            cfg.oracle_url,
            roster.len(),
            cfg.threshold
        );
        Ok(Self::new(
            Retrying::new(http, cfg.retry_policy()),
            Arc::new(ledger),
            Arc::new(roster),
            cfg.thresholds(),
            cfg.access_point.clone(),
        ))
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub async fn register_face(
        &self,
        resident_id: &ResidentId,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> Result<FaceResult, GateError> {
        let resident = self.directory.resolve(resident_id);
        if let Some(refusal) = refuse_enrollment(resident_id, resident.as_ref()) {
            warn!("enrollment refused for {resident_id}: {}", refusal.reason());
            return self.record(refusal, resident.as_ref()).await;
        }

        let outcome = self.client.register(resident_id, image, ctx).await;
        let mode = Mode::Register {
            resident_id: resident_id.clone(),
        };
        let decision = decide(&mode, &outcome, &self.thresholds);
        self.record(decision, resident.as_ref()).await
    }

    pub async fn verify_face(
        &self,
        claimed: &ResidentId,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> Result<FaceResult, GateError> {
        let outcome = self.client.verify(claimed, image, ctx).await;
        let mode = Mode::Verify {
            claimed: claimed.clone(),
        };
        self.settle(decide(&mode, &outcome, &self.thresholds)).await
    }

    pub async fn find_face(
        &self,
        image: &ImagePayload,
        ctx: &CallContext,
    ) -> Result<FaceResult, GateError> {
        let outcome = self.client.identify(image, ctx).await;
        self.settle(decide(&Mode::Identify, &outcome, &self.thresholds))
            .await
    }

    /// Liveness of the oracle; never fails, an unreachable oracle is `false`.
    pub async fn check_server_health(&self, ctx: &CallContext) -> bool {
        self.client.health_check(ctx).await
    }

    async fn settle(&self, decision: AccessDecision) -> Result<FaceResult, GateError> {
        let resident = decision
            .resident_id()
            .and_then(|id| self.directory.resolve(id));
        let decision = apply_resident_policy(decision, resident.as_ref());
        self.record(decision, resident.as_ref()).await
    }

    /// Appends on the blocking pool; the file ledger syncs to disk.
    async fn record(
        &self,
        decision: AccessDecision,
        resident: Option<&Resident>,
    ) -> Result<FaceResult, GateError> {
        info!(
            "{} {} at {}: {} ({}, confidence {:.2})",
            decision.mode(),
            decision.outcome(),
            self.access_point,
            decision.resident_id().map(|r| r.as_str()).unwrap_or("-"),
            decision.reason(),
            decision.confidence()
        );
        if decision.data_quality() {
            warn!("decision based on an out-of-range oracle score");
        }

        let entry = AccessLogEntry::new(decision, resident, &self.access_point);
        let id = entry.id;
        let decision = entry.decision.clone();
        let ledger = Arc::clone(&self.ledger);
        let appended = tokio::task::spawn_blocking(move || ledger.append(&entry))
            .await
            .unwrap_or_else(|e| Err(LedgerError::Rejected(format!("append task failed: {e}"))));
        match appended {
            Ok(()) => Ok(FaceResult::from_decision(decision)),
            Err(source) => {
                error!("audit append failed for entry {id}: {source}");
                Err(GateError::Audit {
                    decision: Box::new(decision),
                    source,
                })
            }
        }
    }
}
