//! Inspect command implementation.

use serde::Serialize;
use std::path::Path;
use verdant_core::MutationQueue;
use verdant_protocol::MutationRecord;

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// Journal file size in bytes.
    pub size: u64,
    /// Queued records, oldest first.
    pub records: Vec<RecordSummary>,
}

/// One queued write as shown by `inspect`.
#[derive(Debug, Serialize)]
pub struct RecordSummary {
    /// Enqueue order.
    pub seq: u64,
    /// Mutation id.
    pub id: String,
    /// Kind of write.
    pub kind: String,
    /// Target post.
    pub target: String,
    /// Lifecycle status.
    pub status: String,
    /// Failed attempts so far.
    pub retries: u32,
    /// Waiting for the user to retry or discard.
    pub parked: bool,
    /// Most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&MutationRecord> for RecordSummary {
    fn from(record: &MutationRecord) -> Self {
        Self {
            seq: record.seq,
            id: record.id.to_string(),
            kind: record.kind.to_string(),
            target: record.target_id.to_string(),
            status: record.status.as_str().to_string(),
            retries: record.retry_count,
            parked: record.parked,
            last_error: record.last_error.clone(),
        }
    }
}

/// Collects the records of an open queue.
pub fn collect(path: &Path, queue: &MutationQueue) -> Result<InspectResult, Box<dyn std::error::Error>> {
    Ok(InspectResult {
        path: path.display().to_string(),
        size: std::fs::metadata(path)?.len(),
        records: queue.records().iter().map(RecordSummary::from).collect(),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let queue = super::open_queue(path)?;
    let result = collect(path, &queue)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Journal: {}", result.path);
    println!("Size:    {} bytes", result.size);
    println!("Records: {}", result.records.len());
    if result.records.is_empty() {
        return;
    }
    println!();
    println!(
        "{:>6}  {:<36}  {:<10}  {:<20}  {:<10}  {:>7}  {}",
        "SEQ", "ID", "KIND", "TARGET", "STATUS", "RETRIES", "LAST ERROR"
    );
    for record in &result.records {
        let status = if record.parked {
            format!("{} (parked)", record.status)
        } else {
            record.status.clone()
        };
        println!(
            "{:>6}  {:<36}  {:<10}  {:<20}  {:<10}  {:>7}  {}",
            record.seq,
            record.id,
            record.kind,
            record.target,
            status,
            record.retries,
            record.last_error.as_deref().unwrap_or("-"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{open_queue, test_support};

    #[test]
    fn lists_records_in_enqueue_order() {
        let (_dir, path, pending, parked) = test_support::journal();
        let queue = open_queue(&path).unwrap();
        let result = collect(&path, &queue).unwrap();

        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].id, pending.to_string());
        assert_eq!(result.records[0].status, "pending");
        assert!(!result.records[0].parked);

        let summary = &result.records[1];
        assert_eq!(summary.id, parked.to_string());
        assert_eq!(summary.status, "failed");
        assert_eq!(summary.retries, 1);
        assert!(summary.parked);
        assert_eq!(summary.last_error.as_deref(), Some("HTTP 503"));
        assert!(result.size > 0);
    }

    #[test]
    fn json_omits_missing_errors() {
        let (_dir, path, _, _) = test_support::journal();
        let queue = open_queue(&path).unwrap();
        let result = collect(&path, &queue).unwrap();
        let json = serde_json::to_value(&result).unwrap();

        assert!(json["records"][0].get("last_error").is_none());
        assert_eq!(json["records"][1]["last_error"], "HTTP 503");
    }

    #[test]
    fn missing_journal_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(open_queue(&dir.path().join("absent.vmq")).is_err());
    }
}
