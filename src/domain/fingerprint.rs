use sha2::{Digest, Sha256};

use crate::domain::changeset::RowMap;
use crate::domain::value_objects::Fingerprint;

/// Incremental SHA-256 over a table's rows, fed in primary-key order.
///
/// Each row contributes its canonical JSON (`RowMap` keeps keys sorted)
/// followed by a newline, so a table can be hashed while it streams from
/// the database without being held in memory. Backs the checksum of
/// drivers without an engine-side one and of the in-memory provider.
#[derive(Default)]
pub struct RowHasher {
    hasher: Sha256,
    rows: u64,
}

impl RowHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, row: &RowMap) {
        let line = serde_json::to_string(row).unwrap_or_default();
        self.hasher.update(line.as_bytes());
        self.hasher.update(b"\n");
        self.rows += 1;
    }

    /// Rows fed so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(format!("{:x}", self.hasher.finalize()))
    }
}

/// Checksum of rows already in key order.
pub fn fingerprint<'a>(rows: impl IntoIterator<Item = &'a RowMap>) -> Fingerprint {
    let mut hasher = RowHasher::new();
    rows.into_iter().for_each(|row| hasher.update(row));
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> RowMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn streaming_matches_slice() {
        let rows = vec![
            row(&[("id", json!(1)), ("v", json!("a"))]),
            row(&[("id", json!(2)), ("v", json!(null))]),
        ];
        let mut hasher = RowHasher::new();
        for r in &rows {
            hasher.update(r);
        }
        assert_eq!(hasher.rows(), 2);
        assert_eq!(hasher.finish(), fingerprint(&rows));
    }

    #[test]
    fn changed_value_changes_checksum() {
        let before = [row(&[("id", json!(1)), ("v", json!("a"))])];
        let after = [row(&[("id", json!(1)), ("v", json!("b"))])];
        assert_ne!(fingerprint(&before), fingerprint(&after));
    }

    #[test]
    fn row_boundaries_are_part_of_the_hash() {
        // Same bytes split differently must not collide.
        let one = [row(&[("v", json!("a\n{\"v\":\"b\"}"))])];
        let two = [row(&[("v", json!("a"))]), row(&[("v", json!("b"))])];
        assert_ne!(fingerprint(&one), fingerprint(&two));
    }

    #[test]
    fn empty_table_has_a_stable_checksum() {
        assert_eq!(fingerprint(&[]), RowHasher::new().finish());
    }
}
