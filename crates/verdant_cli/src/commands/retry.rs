//! Retry command implementation.

use std::path::Path;
use verdant_core::MutationQueue;
use verdant_protocol::{MutationId, MutationRecord, MutationStatus};

/// Returns a parked or failed record to Pending.
///
/// Parked records get a fresh retry budget and move to the back of the
/// queue. Failed records that still have retries left keep their place.
pub fn retry(queue: &MutationQueue, id: MutationId) -> Result<MutationRecord, Box<dyn std::error::Error>> {
    let record = queue
        .get(id)
        .ok_or_else(|| format!("No mutation {id} in the journal"))?;
    let updated = if record.parked {
        queue.retry(id)?
    } else if record.status == MutationStatus::Failed {
        queue.requeue(id)?
    } else {
        return Err(format!("Mutation {id} is {}, nothing to retry", record.status.as_str()).into());
    };
    Ok(updated)
}

/// Runs the retry command.
pub fn run(path: &Path, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let id = super::parse_id(id)?;
    let queue = super::open_queue(path)?;
    let record = retry(&queue, id)?;
    println!("✓ {} {} on {} is pending (seq {})", record.kind, record.id, record.target_id, record.seq);
    Ok(())
}
