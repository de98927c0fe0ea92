use rollcall_core::enrollment::SkippedIdentity;
use rollcall_core::{ModelBundle, ReportRequester, Roster, SamplerHandle, SharedLedger};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use zbus::interface;

/// The running sampler, shared with `main` so shutdown can take it back.
pub type SharedSampler = Arc<Mutex<Option<SamplerHandle>>>;

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub ledger: SharedLedger,
    pub roster: Roster,
    pub models: ModelBundle,
    pub sampler: SharedSampler,
    /// Why sampling never started, if it didn't.
    pub sampler_error: Option<String>,
    pub enrolled: usize,
    pub skipped: Vec<SkippedIdentity>,
    pub match_threshold: f32,
    pub reporter: Arc<dyn ReportRequester>,
}

impl AttendanceService {
    fn sampler(&self) -> MutexGuard<'_, Option<SamplerHandle>> {
        self.sampler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status_json(&self) -> serde_json::Value {
        let snapshot = self.ledger.snapshot();
        let (state, stats) = match &*self.sampler() {
            Some(handle) => (serde_json::json!(handle.state()), serde_json::json!(handle.stats())),
            None => (serde_json::json!("stopped"), serde_json::Value::Null),
        };
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session_id": snapshot.session_id,
            "models": self.models.readiness(),
            "sampler": state,
            "sampler_error": self.sampler_error,
            "stats": stats,
            "match_threshold": self.match_threshold,
            "roster": self.roster.len(),
            "enrolled": self.enrolled,
            "skipped": self.skipped,
            "present": snapshot.present_count(),
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value)
        .map_err(|e| zbus::fdo::Error::Failed(format!("serialization failed: {e}")))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Daemon, model, sampler and enrollment state as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }

    /// Current roster-ordered attendance as JSON.
    async fn snapshot(&self) -> zbus::fdo::Result<String> {
        to_json(&self.ledger.snapshot())
    }

    /// Labeled boxes from the most recent tick as JSON.
    async fn overlay(&self) -> zbus::fdo::Result<String> {
        let overlay = match &*self.sampler() {
            Some(handle) => handle.overlay().borrow().clone(),
            None => return Err(zbus::fdo::Error::Failed("sampler is not running".into())),
        };
        to_json(&overlay)
    }

    /// Natural-language summary of the current session.
    async fn generate_report(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.ledger.snapshot();
        tracing::info!(session = %snapshot.session_id, "report requested");
        self.reporter.summarize(&snapshot).await.map_err(|e| {
            tracing::warn!(error = %e, "report generation failed");
            zbus::fdo::Error::Failed(e.to_string())
        })
    }

    /// Start a new session with everyone Absent. Returns the new session id.
    async fn reset_session(&self) -> zbus::fdo::Result<String> {
        Ok(self.ledger.reset(&self.roster).to_string())
    }
}
