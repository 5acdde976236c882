//! Notification sinks wired into `deployctl run`.

use std::sync::Mutex;

use tracing::warn;

use deploy_core::{RolloutRecord, StageResult, StageStatus};
use deploy_rollout::NotificationSink;
use deploy_state::StateStore;

/// Prints one line per completed stage to stderr.
#[derive(Debug, Default)]
pub struct ProgressSink {
    printed: Mutex<usize>,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Render a finished stage for humans.
pub fn stage_line(result: &StageResult) -> String {
    let mark = match result.status {
        StageStatus::Succeeded => "✓",
        StageStatus::Skipped => "-",
        StageStatus::Cancelled => "!",
        StageStatus::Failed | StageStatus::TimedOut => "✗",
    };
    let attempts = if result.attempts > 1 {
        format!(", {} attempts", result.attempts)
    } else {
        String::new()
    };
    format!(
        "{mark} {:<24} {} ({}ms{attempts})",
        result.stage.to_string(),
        result.detail,
        result.duration_ms()
    )
}

impl NotificationSink for ProgressSink {
    fn record(&self, record: &RolloutRecord) {
        let mut printed = self.printed.lock().unwrap();
        for result in record.stages.iter().skip(*printed) {
            eprintln!("{}", stage_line(result));
        }
        *printed = record.stages.len();
    }
}

/// Persists terminal records, promoting successful ones to known-good.
#[derive(Clone)]
pub struct StoreSink {
    store: StateStore,
}

impl StoreSink {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl NotificationSink for StoreSink {
    fn record(&self, record: &RolloutRecord) {
        if !record.state.is_terminal() {
            return;
        }
        if let Err(e) = self.store.record_outcome(record) {
            warn!(rollout = %record.id, error = %e, "failed to persist rollout record");
        }
    }
}
