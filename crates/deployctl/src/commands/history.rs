use std::path::Path;

use deploy_core::RolloutRecord;

use super::run::open_store;

/// Print the newest `limit` rollouts of an environment and its known-good set.
pub fn history(state_dir: &Path, environment: &str, limit: usize, format: &str) -> anyhow::Result<()> {
    let store = open_store(state_dir)?;
    let records = store.list_rollouts(environment)?;
    let shown = &records[records.len().saturating_sub(limit)..];
    let known_good = store.get_known_good(environment)?;

    match format {
        "json" => {
            let value = serde_json::json!({
                "environment": environment,
                "known_good": known_good,
                "rollouts": shown,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        _ => {
            if shown.is_empty() {
                println!("No rollouts recorded for {environment}");
            }
            for record in shown {
                println!("{}", history_line(record));
            }
            match known_good {
                Some(set) => println!(
                    "Known-good: {} ({})",
                    set.rollout_id,
                    set.artifact
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "no artifact".to_string())
                ),
                None => println!("Known-good: none"),
            }
        }
    }
    Ok(())
}

fn history_line(record: &RolloutRecord) -> String {
    let duration = record
        .finished_at_ms
        .map(|end| format!("{}s", end.saturating_sub(record.started_at_ms) / 1000))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{:<32} {:<16} {:>6}  {} stage(s)",
        record.id,
        record.state.label(),
        duration,
        record.stages.len()
    );
    if let Some(reason) = &record.reason {
        line.push_str(&format!("  {reason}"));
    }
    line
}
