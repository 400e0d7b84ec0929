//! Provisioning Ledger
//!
//! Append-only record of everything exchanged with owner systems. Events
//! are never updated or deleted; request status is a projection of the
//! events. Inbound events are deduplicated by content hash, and ingesting
//! a duplicate replays the original outcome without side effects.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::store::{AppendResult, LedgerEntry, PipelineStore};
use super::types::*;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("provisioning request {0} not found")]
    UnknownRequest(Uuid),

    #[error("{0} events are outbound only")]
    OutboundKind(EventKind),

    #[error("ledger entry {0} has no recorded outcome")]
    MissingOutcome(Uuid),
}

// =============================================================================
// HASHING
// =============================================================================

/// SHA-256 over the canonical JSON of (request, direction, payload).
///
/// serde_json maps are key-ordered, so equal content always hashes equal.
pub fn content_hash(
    request_id: Uuid,
    direction: EventDirection,
    payload: &EventPayload,
) -> Result<String> {
    let canonical = serde_json::to_vec(&json!({
        "request_id": request_id,
        "direction": direction,
        "payload": payload,
    }))
    .context("Failed to serialize event for hashing")?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Deterministic idempotency key for one provisioning attempt.
pub fn idempotency_key(
    cbu_id: Uuid,
    srdef_id: &str,
    parameters: &ResourceParameters,
    attempt: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cbu_id.as_bytes());
    hasher.update(b"|");
    hasher.update(requirement_key(srdef_id, parameters).as_bytes());
    hasher.update(b"|");
    hasher.update(attempt.to_be_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Decide what an inbound event does to its request.
///
/// Status only moves forward: anything arriving after the request left the
/// state the event applies to is recorded with `NoChange`.
pub fn classify_inbound(request: &ProvisioningRequest, payload: &EventPayload) -> EventDisposition {
    let in_flight = request.status.is_in_flight();
    let target = match payload {
        EventPayload::Ack { .. } => ProvisioningStatus::Ack,
        EventPayload::Result {
            result: OwnerProvisioningResult::Success { .. },
        } => ProvisioningStatus::Completed,
        EventPayload::Result {
            result: OwnerProvisioningResult::Failure { .. },
        }
        | EventPayload::Error { .. } => ProvisioningStatus::Failed,
        EventPayload::Status { .. } => return EventDisposition::Recorded,
        EventPayload::RequestSent { .. } | EventPayload::Retry { .. } => {
            return EventDisposition::NoChange {
                reason: "outbound event kind".to_string(),
            }
        }
    };

    if in_flight && request.status.can_transition_to(target) {
        EventDisposition::Applied { status: target }
    } else {
        EventDisposition::NoChange {
            reason: format!("request already {}", request.status),
        }
    }
}

/// Classify `event` against `request` and apply the transition in place.
///
/// Stores call this while holding the request row, so the outcome written
/// to the ledger is the one that took effect.
pub fn apply_inbound(
    request: &mut ProvisioningRequest,
    event: &ProvisioningEvent,
    now: DateTime<Utc>,
) -> IngestOutcome {
    let disposition = classify_inbound(request, &event.payload);
    if let EventDisposition::Applied { status } = &disposition {
        request.status = *status;
        request.status_changed_at = now;
        if let EventPayload::Ack {
            owner_ticket_id: Some(ticket),
        } = &event.payload
        {
            request.owner_ticket_id = Some(ticket.clone());
        }
    }
    IngestOutcome {
        event_id: event.event_id,
        request_id: request.request_id,
        kind: event.payload.kind(),
        disposition,
        request_status: request.status,
    }
}

/// Failure text carried by a failing event.
pub fn failure_reason(payload: &EventPayload) -> Option<String> {
    match payload {
        EventPayload::Result {
            result: OwnerProvisioningResult::Failure { reason },
        } => Some(reason.clone()),
        EventPayload::Error { code, message } => Some(match code {
            Some(code) => format!("{}: {}", code, message),
            None => message.clone(),
        }),
        _ => None,
    }
}

// =============================================================================
// LEDGER
// =============================================================================

/// Thin append/read API over the store's event log.
pub struct ProvisioningLedger<'a> {
    store: &'a dyn PipelineStore,
}

impl<'a> ProvisioningLedger<'a> {
    pub fn new(store: &'a dyn PipelineStore) -> Self {
        Self { store }
    }

    /// Record an outbound event. Outbound hashes include the event kind's
    /// payload, so re-sending an identical request is itself deduplicated.
    pub async fn record_outbound(
        &self,
        request: &ProvisioningRequest,
        payload: EventPayload,
    ) -> Result<LedgerEntry> {
        let hash = content_hash(request.request_id, EventDirection::Out, &payload)?;
        let event = ProvisioningEvent {
            event_id: Uuid::now_v7(),
            request_id: request.request_id,
            occurred_at: Utc::now(),
            direction: EventDirection::Out,
            payload,
            content_hash: Some(hash),
        };
        let kind = event.kind();
        let entry = match self
            .store
            .append_event(request.cbu_id, event, None)
            .await
            .context("Failed to append outbound event")?
        {
            AppendResult::Inserted(entry) => entry,
            AppendResult::Duplicate(entry) => {
                debug!(
                    "Outbound {} for request {} already recorded",
                    kind, request.request_id
                );
                entry
            }
        };
        Ok(entry)
    }

    pub async fn record_request_sent(&self, request: &ProvisioningRequest) -> Result<LedgerEntry> {
        let entry = self
            .record_outbound(
                request,
                EventPayload::RequestSent {
                    payload: request.request_payload.clone(),
                },
            )
            .await?;
        info!(
            "Request {} sent to {} for {}",
            request.request_id, request.owner_system, request.requirement_key
        );
        Ok(entry)
    }

    /// Append an inbound event and apply it to its request in one store step.
    pub async fn record_inbound(&self, cbu_id: Uuid, event: ProvisioningEvent) -> Result<AppendResult> {
        self.store
            .ingest_inbound(cbu_id, event)
            .await
            .context("Failed to append inbound event")
    }

    pub async fn find_by_hash(&self, content_hash: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.store.event_by_hash(content_hash).await?)
    }

    /// Full event history of one request, in append order.
    pub async fn history(&self, request_id: Uuid) -> Result<Vec<ProvisioningEvent>> {
        Ok(self.store.events_for_request(request_id).await?)
    }
}
