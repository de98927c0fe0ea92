//! Attendance summaries. The text itself comes from an external generative
//! service; this module owns the prompt and the requester seam.

use crate::ledger::AttendanceSnapshot;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report service not configured: {0}")]
    NotConfigured(String),
    #[error("failed to reach report service: {0}")]
    Transport(String),
    #[error("report service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("report service returned no text")]
    Empty,
}

/// Turns a final attendance snapshot into prose.
#[async_trait]
pub trait ReportRequester: Send + Sync {
    async fn summarize(&self, snapshot: &AttendanceSnapshot) -> Result<String, ReportError>;
}

fn name_list<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let joined = names.collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "None".to_string()
    } else {
        joined
    }
}

/// Plain-text prompt asking for a short, encouraging session summary.
pub fn build_summary_prompt(snapshot: &AttendanceSnapshot) -> String {
    let present: Vec<&str> = snapshot.present().map(|i| i.name.as_str()).collect();
    let absent: Vec<&str> = snapshot.absent().map(|i| i.name.as_str()).collect();

    format!(
        "Generate a brief, professional, and encouraging attendance summary for a class session.\n\
         \n\
         Total students: {total}\n\
         Present ({present_count}): {present_names}\n\
         Absent ({absent_count}): {absent_names}\n\
         \n\
         Open on a positive note and finish with a short concluding remark, for example \
         \"Great turnout today! Let's get started.\" or \"We're missing a few people, but \
         let's make it a productive session for everyone here.\"\n\
         Do not use markdown formatting. Return plain text only.\n",
        total = snapshot.total(),
        present_count = present.len(),
        present_names = name_list(present.iter().copied()),
        absent_count = absent.len(),
        absent_names = name_list(absent.iter().copied()),
    )
}
