//! Discard command implementation.

use std::path::Path;

/// Runs the discard command.
pub fn run(path: &Path, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let id = super::parse_id(id)?;
    let queue = super::open_queue(path)?;
    let record = queue.discard(id)?;
    println!("✓ Discarded {} {} on {}", record.kind, record.id, record.target_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{open_queue, test_support};

    #[test]
    fn discarded_record_is_gone_after_reopen() {
        let (_dir, path, pending, parked) = test_support::journal();
        run(&path, &parked.to_string()).unwrap();

        let queue = open_queue(&path).unwrap();
        assert!(queue.get(parked).is_none());
        assert!(queue.get(pending).is_some());
    }

    #[test]
    fn malformed_id_is_refused() {
        let (_dir, path, _, _) = test_support::journal();
        assert!(run(&path, "not-a-uuid").is_err());
        assert_eq!(open_queue(&path).unwrap().len(), 2);
    }
}
