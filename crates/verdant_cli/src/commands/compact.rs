//! Compact command implementation.

use std::path::Path;

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Live records kept.
    pub records: usize,
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction.
    pub bytes_after: u64,
}

/// Rewrites the journal so it holds only the live records.
pub fn compact(path: &Path) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let bytes_before = std::fs::metadata(path)?.len();
    let queue = super::open_queue(path)?;
    queue.compact()?;
    let records = queue.len();
    drop(queue);
    Ok(CompactStats {
        records,
        bytes_before,
        bytes_after: std::fs::metadata(path)?.len(),
    })
}

/// Runs the compact command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting journal at {:?}", path);
    let stats = compact(path)?;

    println!("  Live records: {}", stats.records);
    println!("  Size before:  {} bytes", stats.bytes_before);
    println!("  Size after:   {} bytes", stats.bytes_after);
    println!(
        "  Space saved:  {} bytes",
        stats.bytes_before.saturating_sub(stats.bytes_after)
    );
    println!("✓ Compaction complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{open_queue, test_support};

    #[test]
    fn compaction_shrinks_and_keeps_records() {
        let (_dir, path, pending, parked) = test_support::journal();
        let stats = compact(&path).unwrap();

        assert_eq!(stats.records, 2);
        assert!(stats.bytes_after < stats.bytes_before);

        let queue = open_queue(&path).unwrap();
        assert!(queue.get(pending).is_some());
        assert!(queue.get(parked).unwrap().parked);
    }
}
