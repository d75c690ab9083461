// 🚦 Chronological Gate - strictly increasing createdAt per subject and kind

use crate::classifier::Assignment;
use crate::events::{ChangeEvent, EventKind};
use crate::ledger::EventHistory;
use anyhow::Result;
use chrono::NaiveDateTime;
use tracing::debug;

/// Admit only when strictly newer than the last admitted event; no prior admits
pub fn admit(created_at: NaiveDateTime, last_admitted: Option<NaiveDateTime>) -> bool {
    last_admitted.map_or(true, |last| created_at > last)
}

/// Gate backed by the admitted-event watermarks in storage
#[derive(Debug, Clone, Copy, Default)]
pub struct ChronologicalGate;

impl ChronologicalGate {
    pub fn new() -> Self {
        ChronologicalGate
    }

    /// Modification watermarks are per worker key; other kinds per subject only
    pub fn watermark_key(assignment: &Assignment) -> Option<&str> {
        match assignment.kind {
            EventKind::Modification => Some(assignment.worker_key.as_str()),
            EventKind::Onboarding | EventKind::Termination => None,
        }
    }

    pub fn check(
        &self,
        event: &ChangeEvent,
        assignment: &Assignment,
        history: &dyn EventHistory,
    ) -> Result<bool> {
        let last = history.last_admitted_at(
            &event.subject(),
            assignment.kind,
            Self::watermark_key(assignment),
        )?;
        let admitted = admit(event.created_at, last);
        if !admitted {
            debug!(
                subject = %event.subject(),
                kind = %assignment.kind,
                created_at = %event.created_at,
                "rejected by chronological gate"
            );
        }
        Ok(admitted)
    }
}
