use std::io;

use clap::{CommandFactory, Parser};
use colored::*;
use tracing_subscriber::EnvFilter;

use selfpatch::batch::ModificationRequest;
use selfpatch::cli::{resolve_token, Args, Command};
use selfpatch::config::PipelineConfig;
use selfpatch::health::{HealthCheckOptions, HealthReport};
use selfpatch::jobs::{JobStatus, JobView};
use selfpatch::orchestrator::RunDisposition;
use selfpatch::rollback::RollbackOutcome;
use selfpatch::service::{PipelineService, PolicySummary, ProposeReceipt};
use selfpatch::store::ModificationLogEntry;

// ---------------------------------------------------------------------------
// Terminal rendering
// ---------------------------------------------------------------------------

fn print_header(title: &str) {
    println!("{}", title.bright_cyan().bold());
    println!("{}", "=".repeat(50).bright_blue());
}

fn disposition_label(disposition: RunDisposition) -> ColoredString {
    match disposition {
        RunDisposition::Committed => "committed".bright_green().bold(),
        RunDisposition::Rejected => "rejected".bright_red(),
        RunDisposition::SnapshotFailed => "snapshot failed".bright_red(),
        RunDisposition::RolledBack => "rolled back".bright_yellow(),
        RunDisposition::RollbackFailed => "ROLLBACK FAILED".bright_red().bold(),
        RunDisposition::Aborted => "aborted".bright_yellow(),
    }
}

fn status_label(status: JobStatus) -> ColoredString {
    match status {
        JobStatus::Running => "running".bright_cyan(),
        JobStatus::Completed => "completed".bright_green(),
        JobStatus::Failed => "failed".bright_red(),
        JobStatus::Aborted => "aborted".bright_yellow(),
    }
}

fn print_receipt(receipt: &ProposeReceipt) {
    print_header("SELFPATCH RUN");
    println!("{}: {}", "Job".bright_yellow(), receipt.job_id);
    println!(
        "{}: {}",
        "Disposition".bright_yellow(),
        disposition_label(receipt.outcome.disposition)
    );
    if let Some(id) = receipt.outcome.snapshot_id {
        println!("{}: {}", "Snapshot".bright_yellow(), id);
    }
    for error in &receipt.outcome.validation_errors {
        println!("  {} {}", "rejected:".bright_red(), error);
    }
    for warning in &receipt.outcome.validation_warnings {
        println!("  {} {}", "warning:".bright_yellow(), warning);
    }
    for file in &receipt.outcome.per_file {
        let verdict = if file.success {
            "ok".bright_green()
        } else {
            "failed".bright_red()
        };
        print!("  [{}] {:?} {}", verdict, file.action, file.file_path.bright_white());
        match &file.error {
            Some(e) => println!(" ({})", e),
            None => println!(),
        }
    }
    if let Some(report) = &receipt.outcome.health {
        print_checks(report);
    }
    if let Some(failure) = &receipt.outcome.failure {
        println!("{}: {}", "Failure".bright_red(), failure);
    }
}

fn print_checks(report: &HealthReport) {
    for check in &report.checks {
        let verdict = if check.skipped {
            "skip".bright_black()
        } else if check.passed {
            "pass".bright_green()
        } else {
            "FAIL".bright_red().bold()
        };
        println!(
            "  [{}] {} ({} ms) {}",
            verdict,
            check.name.bright_white(),
            check.duration_ms,
            check.message
        );
    }
}

fn print_health(report: &HealthReport) {
    print_header("HEALTH CHECK");
    print_checks(report);
    let verdict = if report.healthy {
        "healthy".bright_green().bold()
    } else {
        "unhealthy".bright_red().bold()
    };
    println!("{}: {}", "Verdict".bright_yellow(), verdict);
}

fn print_rollback(outcome: &RollbackOutcome) {
    print_header("ROLLBACK");
    println!("{}: {}", "Snapshot".bright_yellow(), outcome.snapshot_id);
    println!("{}: {}", "Files restored".bright_yellow(), outcome.files_restored);
    println!("{}: {}", "Files removed".bright_yellow(), outcome.files_removed);
}

fn print_history(entries: &[ModificationLogEntry]) {
    print_header("MODIFICATION HISTORY");
    if entries.is_empty() {
        println!("  (no entries)");
        return;
    }
    for entry in entries {
        let state = if entry.rolled_back {
            "rolled back".bright_yellow()
        } else if entry.applied {
            "applied".bright_green()
        } else {
            "not applied".bright_red()
        };
        let snapshot = match entry.snapshot_id {
            Some(id) => format!("snap {}", id),
            None => "no snap".to_string(),
        };
        print!(
            "  #{} [{}] {} {} ({}) {}",
            entry.id,
            state,
            entry.action,
            entry.target_file.bright_white(),
            snapshot,
            entry.description
        );
        match &entry.error_message {
            Some(e) => println!(" {} {}", "error:".bright_red(), e),
            None => println!(),
        }
    }
}

fn print_policy(summary: &PolicySummary) {
    print_header("ACTIVE POLICY");
    println!("{}", "Protected paths (never writable):".bright_yellow());
    for path in &summary.protected_paths {
        println!("  {}", path.bright_red());
    }
    println!("{}", "Allowed directories:".bright_yellow());
    for dir in &summary.allowed_directories {
        println!("  {}", dir.bright_green());
    }
}

fn print_job(view: &JobView) {
    print_header("JOB STATUS");
    println!("{}: {}", "Job".bright_yellow(), view.job_id);
    println!("{}: {}", "Status".bright_yellow(), status_label(view.status));
    println!("{}: {}", "Phase".bright_yellow(), view.current_phase);
    println!("{}: {}", "Steps completed".bright_yellow(), view.steps_completed);
    if let Some(event) = &view.last_event {
        println!("{}: {}", "Last event".bright_yellow(), event);
    }
    if let Some(outcome) = &view.result {
        println!(
            "{}: {}",
            "Disposition".bright_yellow(),
            disposition_label(outcome.disposition)
        );
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A batch file is a JSON array of modification requests.
fn parse_batch(raw: &str) -> Result<Vec<ModificationRequest>, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Exit-code policy: only a committed run counts as success.
fn run_succeeded(disposition: RunDisposition) -> bool {
    disposition == RunDisposition::Committed
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("selfpatch=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn emit<T: serde::Serialize>(json: bool, payload: &T, render: impl FnOnce(&T)) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(payload)?);
    } else {
        render(payload);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Completions need no project root, config file, or database.
    if let Command::Completions { shell } = &args.command {
        let mut cmd = Args::command();
        clap_complete::generate(*shell, &mut cmd, "selfpatch", &mut io::stdout());
        return Ok(());
    }

    init_tracing();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.project_root = std::fs::canonicalize(&args.root)?;
    let config = config.admin_token_from_env();

    let token = resolve_token(args.token.clone(), std::env::var("SELFPATCH_ADMIN_TOKEN").ok());
    let service = PipelineService::new(config)?;
    let ctx = service.context(args.requested_by.clone(), args.user.clone(), token.as_deref());

    match args.command {
        Command::Propose { batch, description } => {
            let raw = std::fs::read_to_string(&batch)?;
            let requests = parse_batch(&raw)?;
            let receipt = service.propose_modification(&ctx, requests, description).await?;
            emit(args.json, &receipt, print_receipt)?;
            if !run_succeeded(receipt.outcome.disposition) {
                return Err(format!("run ended {}", receipt.outcome.disposition).into());
            }
        }
        Command::Health { skip_type_check, skip_tests } => {
            let options = HealthCheckOptions { skip_type_check, skip_tests };
            let report = service.run_health_check(&options).await;
            emit(args.json, &report, print_health)?;
            if !report.healthy {
                return Err(format!("{} check(s) failed", report.failed_names().len()).into());
            }
        }
        Command::Rollback { snapshot } => {
            let outcome = service.rollback(&ctx, snapshot).await?;
            emit(args.json, &outcome, print_rollback)?;
        }
        Command::History { limit } => {
            let entries = service.history(limit)?;
            emit(args.json, &entries, |e| print_history(e))?;
        }
        Command::Policy => {
            let summary = service.policy();
            emit(args.json, &summary, print_policy)?;
        }
        Command::Status { job_id } => {
            let view = service.job_status(job_id)?;
            emit(args.json, &view, print_job)?;
        }
        Command::Cancel { job_id } => {
            let view = service.cancel_job(&ctx, job_id)?;
            emit(args.json, &view, print_job)?;
        }
        Command::Restart { reason } => {
            let ack = service.request_restart(&ctx, &reason)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&ack)?);
            } else {
                println!("{}", ack.message);
            }
            if !ack.accepted {
                return Err(ack.message.into());
            }
        }
        // Handled before config load.
        Command::Completions { .. } => {}
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use selfpatch::batch::FileAction;

    // -- Batch file parsing -------------------------------------------------

    #[test]
    fn test_parse_batch_array() {
        let raw = r#"[
            {"file_path": "src/retry.rs", "action": "modify",
             "content": "pub fn retry() {}\n", "description": "tighten retry loop"},
            {"file_path": "src/old.rs", "action": "delete",
             "description": "drop dead module"}
        ]"#;
        let batch = parse_batch(raw).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].file_path, "src/retry.rs");
        assert_eq!(batch[0].action, FileAction::Modify);
        assert!(batch[0].content.is_some());
        assert_eq!(batch[1].action, FileAction::Delete);
        assert!(batch[1].content.is_none());
    }

    #[test]
    fn test_parse_batch_rejects_top_level_object() {
        let raw = r#"{"file_path": "src/retry.rs", "action": "modify"}"#;
        assert!(parse_batch(raw).is_err());
    }

    #[test]
    fn test_parse_batch_rejects_unknown_action() {
        let raw = r#"[{"file_path": "a.rs", "action": "truncate", "description": "x"}]"#;
        assert!(parse_batch(raw).is_err());
    }

    // -- Exit-code policy ---------------------------------------------------

    #[test]
    fn test_run_succeeded_only_for_committed() {
        assert!(run_succeeded(RunDisposition::Committed));
        assert!(!run_succeeded(RunDisposition::Rejected));
        assert!(!run_succeeded(RunDisposition::SnapshotFailed));
        assert!(!run_succeeded(RunDisposition::RolledBack));
        assert!(!run_succeeded(RunDisposition::RollbackFailed));
        assert!(!run_succeeded(RunDisposition::Aborted));
    }
}
