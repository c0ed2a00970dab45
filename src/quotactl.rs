//! Operator CLI library for `quotactl`.
//!
//! Commands read the status ledger directly, so they work whether or not a
//! controller is running. The binary and the tests share these functions.

use std::io::Write;
use std::path::Path;

use crate::clock::system_epoch_ms;
use crate::job::{JobRecord, JobState};
use crate::ledger::Ledger;
use crate::settings::AppConfig;

/// Global options that apply to all quotactl commands
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Output in JSON format instead of human-readable tables
    pub json: bool,
}

/// Format a timestamp in milliseconds as RFC 3339
fn format_timestamp_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| format!("{}ms", ms))
}

fn write_record_table_header<W: Write>(out: &mut W) -> anyhow::Result<()> {
    writeln!(
        out,
        "{:<36}  {:<10}  {:>7}  {:<24}  Job ID",
        "Document", "State", "Attempt", "Updated"
    )?;
    writeln!(out, "{}", "-".repeat(100))?;
    Ok(())
}

fn write_record_row<W: Write>(out: &mut W, record: &JobRecord) -> anyhow::Result<()> {
    writeln!(
        out,
        "{:<36}  {:<10}  {:>7}  {:<24}  {}",
        record.document_id,
        record.state,
        record.attempt,
        format_timestamp_ms(record.updated_at_ms),
        record.job_id.as_deref().unwrap_or("-")
    )?;
    Ok(())
}

/// List every document currently in `state`
pub async fn list_jobs<W: Write>(
    ledger: &dyn Ledger,
    opts: &GlobalOptions,
    out: &mut W,
    state: JobState,
) -> anyhow::Result<()> {
    let records = ledger.list_by_state(state).await?;
    if opts.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
        return Ok(());
    }
    if records.is_empty() {
        writeln!(out, "No documents in state {}", state)?;
        return Ok(());
    }
    write_record_table_header(out)?;
    for record in &records {
        write_record_row(out, record)?;
    }
    writeln!(out)?;
    writeln!(out, "{} document(s) {}", records.len(), state)?;
    Ok(())
}

/// Print one document's record
pub async fn job_get<W: Write>(
    ledger: &dyn Ledger,
    opts: &GlobalOptions,
    out: &mut W,
    document_id: &str,
) -> anyhow::Result<()> {
    let record = ledger
        .get(document_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("document '{}' not found", document_id))?;

    if opts.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
        return Ok(());
    }

    writeln!(out, "Document: {}", record.document_id)?;
    writeln!(out, "Source:   {}", record.document)?;
    writeln!(out, "State:    {}", record.state)?;
    writeln!(out, "Attempt:  {}", record.attempt)?;
    writeln!(out, "Job ID:   {}", record.job_id.as_deref().unwrap_or("-"))?;
    writeln!(out, "Created:  {}", format_timestamp_ms(record.created_at_ms))?;
    writeln!(out, "Updated:  {}", format_timestamp_ms(record.updated_at_ms))?;
    if let Some(failure) = record.failure {
        writeln!(out, "Failure:  {:?}", failure)?;
    }
    if let Some(err) = &record.last_error {
        writeln!(out, "Error:    {}", err)?;
    }
    if let Some(key) = &record.output_key {
        writeln!(out, "Output:   {}", key)?;
    }
    if !record.retries.is_empty() {
        writeln!(out)?;
        writeln!(out, "Retries:")?;
        for retry in &record.retries {
            writeln!(
                out,
                "  {}  {:<10}  delay {}ms (ceiling {}ms)",
                format_timestamp_ms(retry.at_ms),
                retry.class,
                retry.delay_ms,
                retry.ceiling_ms
            )?;
        }
    }
    Ok(())
}

/// Move an abandoned document back to Pending with a fresh attempt budget.
/// A running controller picks it up on its next submission sweep.
pub async fn job_requeue<W: Write>(
    ledger: &dyn Ledger,
    opts: &GlobalOptions,
    out: &mut W,
    document_id: &str,
) -> anyhow::Result<()> {
    let record = ledger
        .get(document_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("document '{}' not found", document_id))?;
    if record.state != JobState::Abandoned {
        anyhow::bail!(
            "document '{}' is {}; only abandoned documents can be requeued",
            document_id,
            record.state
        );
    }
    let fresh = record.requeued(system_epoch_ms());
    ledger.put(&fresh).await?;

    if opts.json {
        let json_output = serde_json::json!({
            "status": "requeued",
            "document_id": document_id,
            "generation": fresh.generation,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&json_output)?)?;
    } else {
        writeln!(
            out,
            "Requeued {} (generation {})",
            document_id, fresh.generation
        )?;
    }
    Ok(())
}

/// Validate a configuration file (or the built-in profile) and print the
/// limits derived from it
pub fn check_config<W: Write>(
    opts: &GlobalOptions,
    out: &mut W,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let source = config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<built-in defaults>".to_string());
    let cfg = match AppConfig::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            if opts.json {
                let json_output = serde_json::json!({
                    "status": "invalid",
                    "config_path": source,
                    "error": e.to_string(),
                });
                writeln!(out, "{}", serde_json::to_string_pretty(&json_output)?)?;
            } else {
                writeln!(out, "Config error: {}", e)?;
            }
            return Err(anyhow::anyhow!("Config validation failed: {}", e));
        }
    };

    let q = &cfg.quota;
    if opts.json {
        let json_output = serde_json::json!({
            "status": "valid",
            "config_path": source,
            "start_tps": q.start_rate(),
            "poll_tps": q.poll_rate(),
            "detect_tps": q.detect_rate(),
            "max_in_flight": q.max_in_flight(),
            "document_timeout_ms": q.document_timeout_ms,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&json_output)?)?;
    } else {
        writeln!(out, "Config is valid: {}", source)?;
        writeln!(
            out,
            "  start rate:     {:.2}/s (published {})",
            q.start_rate(),
            q.published_start_tps
        )?;
        writeln!(
            out,
            "  poll rate:      {:.2}/s (published {})",
            q.poll_rate(),
            q.published_poll_tps
        )?;
        writeln!(
            out,
            "  detect rate:    {:.2}/s (published {})",
            q.detect_rate(),
            q.published_detect_tps
        )?;
        writeln!(
            out,
            "  max in flight:  {} (published {})",
            q.max_in_flight(),
            q.published_max_concurrent_jobs
        )?;
        writeln!(
            out,
            "  throttled retries: {} (base {}ms, max {}ms)",
            cfg.backoff.throttled.max_attempts,
            cfg.backoff.throttled.base_delay_ms,
            cfg.backoff.throttled.max_delay_ms
        )?;
        writeln!(
            out,
            "  transient retries: {} (base {}ms, max {}ms)",
            cfg.backoff.transient.max_attempts,
            cfg.backoff.transient.base_delay_ms,
            cfg.backoff.transient.max_delay_ms
        )?;
    }
    Ok(())
}
