//! Case-insensitive name index
//!
//! Maps element names to slot indices in the project store, one table per
//! object kind. Names compare case-insensitively over ASCII; the hash is a
//! Fletcher checksum that tolerates arbitrary byte values. Collisions chain
//! in front of the bucket, and inserting a name that already exists (in any
//! case spelling) is a [`EngineError::DuplicateName`] error.

use crate::error::{EngineError, Result};

const TABLE_SIZE: usize = 1999;

fn fold(b: u8) -> u8 {
    b.to_ascii_uppercase()
}

fn same_name(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .all(|(x, y)| fold(x) == fold(y))
}

/// Fletcher 16-bit checksum over case-folded bytes, reduced to a bucket.
fn hash(name: &str) -> usize {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    for b in name.bytes() {
        sum1 += fold(b) as u32;
        if sum1 >= 255 {
            sum1 -= 255;
        }
        sum2 += sum1;
    }
    let mut check1 = sum2 % 255;
    check1 = 255 - (sum1 + check1) % 255;
    let low = 255 - (sum1 + check1) % 255;
    (((check1 << 8) | low) as usize) % TABLE_SIZE
}

/// A name-to-index table for one object kind.
#[derive(Debug, Clone)]
pub struct NameIndex {
    buckets: Vec<Vec<(String, usize)>>,
    len: usize,
}

impl Default for NameIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl NameIndex {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); TABLE_SIZE],
            len: 0,
        }
    }

    /// Register `name` at `slot`. Duplicate names (case-insensitively) are
    /// rejected.
    pub fn insert(&mut self, name: &str, slot: usize) -> Result<()> {
        let bucket = &mut self.buckets[hash(name)];
        if bucket.iter().any(|(k, _)| same_name(k, name)) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        bucket.insert(0, (name.to_string(), slot));
        self.len += 1;
        Ok(())
    }

    /// Look up the slot registered for `name`, ignoring ASCII case.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.buckets[hash(name)]
            .iter()
            .find(|(k, _)| same_name(k, name))
            .map(|&(_, slot)| slot)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over registered (name, slot) pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.buckets
            .iter()
            .flat_map(|b| b.iter().map(|(k, v)| (k.as_str(), *v)))
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_ascii_case() {
        let mut idx = NameIndex::new();
        idx.insert("Pump-Station_1", 7).unwrap();
        assert_eq!(idx.find("PUMP-STATION_1"), Some(7));
        assert_eq!(idx.find("pump-station_1"), Some(7));
        assert_eq!(idx.find("pump-station_2"), None);
    }

    #[test]
    fn duplicate_insert_is_rejected_across_case() {
        let mut idx = NameIndex::new();
        idx.insert("J1", 0).unwrap();
        assert!(matches!(
            idx.insert("j1", 1),
            Err(EngineError::DuplicateName(_))
        ));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn hash_tolerates_arbitrary_bytes() {
        let mut idx = NameIndex::new();
        idx.insert("nœud-été", 3).unwrap();
        assert_eq!(idx.find("nœud-été"), Some(3));
    }

    #[test]
    fn colliding_names_chain_in_one_bucket() {
        // Names longer than the checksum period are prone to collide; insert
        // enough entries that chains certainly form and verify all resolve.
        let mut idx = NameIndex::new();
        let names: Vec<String> = (0..5000).map(|i| format!("NODE_{i}")).collect();
        for (i, n) in names.iter().enumerate() {
            idx.insert(n, i).unwrap();
        }
        for (i, n) in names.iter().enumerate() {
            assert_eq!(idx.find(n), Some(i));
        }
    }
}
