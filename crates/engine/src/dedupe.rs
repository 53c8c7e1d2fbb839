//! Deduplicator: one record per natural key, most recent wins.

use std::cmp::Ordering;
use std::collections::HashMap;

use medallion_storage::RowKey;

use crate::record::{NaturalKey, Record};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deduplicated {
    /// One record per key, in the order each key first appeared.
    pub records: Vec<Record>,
    pub duplicates_dropped: usize,
}

/// Keep, per natural key, the record with the greatest `recency_column`.
///
/// Null recency ranks below any present value. Remaining ties go to the
/// record seen last.
pub fn dedupe(records: Vec<Record>, natural_key: &NaturalKey, recency_column: &str) -> Deduplicated {
    let mut out: Vec<Record> = Vec::with_capacity(records.len());
    let mut slots: HashMap<RowKey, usize> = HashMap::new();
    let mut duplicates_dropped = 0;

    for record in records {
        let key = record.key(natural_key);
        match slots.get(&key) {
            Some(&slot) => {
                duplicates_dropped += 1;
                if newer_or_equal(&record, &out[slot], recency_column) {
                    out[slot] = record;
                }
            }
            None => {
                slots.insert(key, out.len());
                out.push(record);
            }
        }
    }

    Deduplicated {
        records: out,
        duplicates_dropped,
    }
}

fn newer_or_equal(candidate: &Record, kept: &Record, recency_column: &str) -> bool {
    let new = candidate.get(recency_column);
    let old = kept.get(recency_column);
    match (new.is_null(), old.is_null()) {
        (true, false) => false,
        (false, true) | (true, true) => true,
        (false, false) => new.compare(old) != Some(Ordering::Less),
    }
}
