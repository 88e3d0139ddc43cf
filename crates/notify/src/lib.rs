//! ephem notify: where lifecycle results go once an operation finishes.
//!
//! The orchestrator only sees [`NotificationSink`]. Sinks are best-effort:
//! `notify` cannot fail, implementations log their own errors.
//!
//! - [`GitHubSink`] keeps one marked comment per PR up to date
//! - [`LogSink`] writes the summary to the log (used with `--skip-github`)
//! - [`MemorySink`] records results for tests

#![forbid(unsafe_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ephem_core::{LifecycleResult, LifecycleStatus, Operation};
use tracing::{info, warn};

pub mod error;
pub mod github;

pub use error::NotificationError;
pub use github::GitHubSink;

/// Hidden marker identifying the comment this tool owns on a PR.
pub const COMMENT_MARKER: &str = "<!-- ephem:preview -->";

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Sink name for logs.
    fn name(&self) -> &'static str;

    async fn notify(&self, pr: u64, result: &LifecycleResult);
}

/// Writes a one-line summary per result.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, pr: u64, result: &LifecycleResult) {
        for (service, url) in &result.urls {
            info!(pr, service = %service, url = %url, "preview url");
        }
        if result.is_success() {
            info!(pr, operation = %result.operation, status = %result.status, "lifecycle result");
        } else {
            warn!(
                pr,
                operation = %result.operation,
                status = %result.status,
                errors = result.errors.len(),
                "lifecycle result"
            );
        }
    }
}

/// Keeps every result it receives.
#[derive(Default)]
pub struct MemorySink {
    seen: Mutex<Vec<(u64, LifecycleResult)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<(u64, LifecycleResult)> {
        self.seen.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn notify(&self, pr: u64, result: &LifecycleResult) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((pr, result.clone()));
        }
    }
}

fn status_line(result: &LifecycleResult) -> String {
    let env = result.environment.as_ref().map(|e| e.as_str()).unwrap_or("(none)");
    match (result.operation, result.status) {
        (Operation::Create, LifecycleStatus::Succeeded) => format!("✅ Preview environment `{}` is ready.", env),
        (Operation::Create, LifecycleStatus::PartiallyFailed) => {
            format!("⚠️ Preview environment `{}` is only partially deployed.", env)
        }
        (Operation::Create, LifecycleStatus::Failed) => format!("❌ Preview environment `{}` could not be deployed.", env),
        (Operation::Delete, LifecycleStatus::Failed) => {
            format!("❌ Preview environment `{}` could not be removed.", env)
        }
        (Operation::Delete, _) => format!("🧹 Preview environment `{}` has been removed.", env),
    }
}

/// Markdown body of the PR comment, starting with [`COMMENT_MARKER`].
pub fn format_comment(pr: u64, result: &LifecycleResult, at: DateTime<Utc>) -> String {
    let mut out = String::new();
    out.push_str(COMMENT_MARKER);
    out.push_str("\n\n");
    out.push_str(&status_line(result));
    out.push('\n');

    if result.operation == Operation::Create && !result.urls.is_empty() {
        out.push('\n');
        for (service, url) in &result.urls {
            out.push_str(&format!("**{}:** {}\n", service, url));
        }
    }

    if !result.errors.is_empty() {
        out.push_str("\n<details><summary>Problems</summary>\n\n");
        for e in &result.errors {
            out.push_str(&format!("- {}\n", e));
        }
        out.push_str("\n</details>\n");
    }

    if result.operation == Operation::Create {
        out.push_str("\nThe environment will be automatically deleted when this PR is closed.\n");
    }
    out.push_str(&format!("\n<sub>PR #{} · updated {}</sub>\n", pr, at.format("%Y-%m-%d %H:%M:%S UTC")));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ephem_core::{EnvironmentId, ErrorCause, LifecycleError, ResourceKind, ResourceRef};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn created(pr: u64) -> LifecycleResult {
        let env = EnvironmentId::from_pr(pr).unwrap();
        let mut r = LifecycleResult::new(Operation::Create, pr, Some(env));
        r.urls.insert("web".into(), "http://localhost/pr-42/".into());
        r
    }

    #[test]
    fn success_comment_lists_urls() {
        let body = format_comment(42, &created(42), at());
        assert!(body.starts_with(COMMENT_MARKER));
        assert!(body.contains("`pr-42` is ready"));
        assert!(body.contains("**web:** http://localhost/pr-42/"));
        assert!(body.contains("2024-05-01 12:00:00 UTC"));
        assert!(!body.contains("Problems"));
    }

    #[test]
    fn partial_comment_lists_problems() {
        let mut r = created(42);
        r.status = LifecycleStatus::PartiallyFailed;
        r.errors.push(LifecycleError::resource(
            ResourceRef::new(ResourceKind::Deployment, Some("pr-42"), "api"),
            ErrorCause::ReadinessTimeout { attempts: 30 },
        ));
        let body = format_comment(42, &r, at());
        assert!(body.contains("partially deployed"));
        assert!(body.contains("- Deployment/pr-42/api: not ready after 30 readiness checks"));
    }

    #[test]
    fn delete_comment_states_removal() {
        let env = EnvironmentId::from_pr(7).unwrap();
        let r = LifecycleResult::new(Operation::Delete, 7, Some(env));
        let body = format_comment(7, &r, at());
        assert!(body.contains("`pr-7` has been removed"));
        assert!(!body.contains("automatically deleted"));
    }

    #[tokio::test]
    async fn memory_sink_records() {
        let sink = MemorySink::new();
        sink.notify(42, &created(42)).await;
        LogSink.notify(42, &created(42)).await;
        let got = sink.received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 42);
    }
}
