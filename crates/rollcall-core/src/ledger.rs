//! Per-session attendance state. Statuses only ever move from Absent to Present.

use crate::types::{AttendanceStatus, Identity, IdentityId, RecognitionEvent, Roster};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyPresent,
    UnknownIdentity,
}

#[derive(Debug, Clone)]
pub struct AttendanceLedger {
    session_id: Uuid,
    entries: Vec<(Identity, AttendanceStatus)>,
}

impl AttendanceLedger {
    /// Fresh session: everyone on the roster starts Absent.
    pub fn new(roster: &Roster) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            entries: roster
                .identities()
                .iter()
                .map(|identity| (identity.clone(), AttendanceStatus::Absent))
                .collect(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn status(&self, id: IdentityId) -> Option<AttendanceStatus> {
        self.entries
            .iter()
            .find(|(identity, _)| identity.id == id)
            .map(|(_, status)| *status)
    }

    /// Idempotent. Unknown ids are logged and ignored.
    pub fn mark_present(&mut self, id: IdentityId) -> MarkOutcome {
        let Some((identity, status)) = self
            .entries
            .iter_mut()
            .find(|(identity, _)| identity.id == id)
        else {
            tracing::warn!(%id, "recognition event for identity not on the roster");
            return MarkOutcome::UnknownIdentity;
        };
        match *status {
            AttendanceStatus::Present => MarkOutcome::AlreadyPresent,
            AttendanceStatus::Absent => {
                *status = AttendanceStatus::Present;
                tracing::info!(id = %identity.id, name = %identity.name, "marked present");
                MarkOutcome::Marked
            }
        }
    }

    /// Apply one tick's events; returns how many identities changed to Present.
    pub fn apply(&mut self, events: &[RecognitionEvent]) -> usize {
        events
            .iter()
            .filter(|e| self.mark_present(e.identity_id) == MarkOutcome::Marked)
            .count()
    }

    pub fn present_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, status)| *status == AttendanceStatus::Present)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> AttendanceSnapshot {
        AttendanceSnapshot {
            session_id: self.session_id,
            taken_at: Utc::now(),
            entries: self
                .entries
                .iter()
                .map(|(identity, status)| SnapshotEntry {
                    identity: identity.clone(),
                    status: *status,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotEntry {
    pub identity: Identity,
    pub status: AttendanceStatus,
}

/// Read-only, roster-ordered copy of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceSnapshot {
    pub session_id: Uuid,
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<SnapshotEntry>,
}

impl AttendanceSnapshot {
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn present_count(&self) -> usize {
        self.present().count()
    }

    pub fn present(&self) -> impl Iterator<Item = &Identity> + '_ {
        self.with_status(AttendanceStatus::Present)
    }

    pub fn absent(&self) -> impl Iterator<Item = &Identity> + '_ {
        self.with_status(AttendanceStatus::Absent)
    }

    fn with_status(&self, status: AttendanceStatus) -> impl Iterator<Item = &Identity> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.status == status)
            .map(|e| &e.identity)
    }
}

/// The ledger shared between the sampling loop and readers.
///
/// Every mutation happens under one lock acquisition, so readers never see a
/// tick half-applied.
#[derive(Debug, Clone)]
pub struct SharedLedger {
    inner: Arc<Mutex<AttendanceLedger>>,
}

impl SharedLedger {
    pub fn new(roster: &Roster) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AttendanceLedger::new(roster))),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, AttendanceLedger> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> AttendanceSnapshot {
        self.lock().snapshot()
    }

    pub fn apply(&self, events: &[RecognitionEvent]) -> usize {
        self.lock().apply(events)
    }

    /// Start a new session: all statuses back to Absent, new session id.
    pub fn reset(&self, roster: &Roster) -> Uuid {
        let mut ledger = self.lock();
        *ledger = AttendanceLedger::new(roster);
        tracing::info!(session = %ledger.session_id(), "attendance session reset");
        ledger.session_id()
    }
}
