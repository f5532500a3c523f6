use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::TurnWarning;
use crate::memory::FilterMemory;
use crate::record::{row_key, ProductRecord, RawRow};

pub const DEFAULT_SAMPLE_CAP: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub records: Vec<ProductRecord>,
    /// Input memory with the sampled keys and their group keys recorded as shown.
    pub memory: FilterMemory,
    pub warnings: Vec<TurnWarning>,
    /// Distinct products that matched before exclusion of shown keys.
    pub candidate_count: usize,
    /// Every candidate had already been shown, so a new cycle was started.
    pub exhausted: bool,
}

/// Collapse rows to one representative per product, skip products already shown, and draw
/// a seeded sample of at most `cap`.
///
/// A product counts as shown when its key or its group key was recorded, so a sibling
/// variant row that surfaces as the representative later is not shown twice.
#[must_use]
pub fn reduce(rows: &[RawRow], memory: &FilterMemory, cap: usize) -> Reduction {
    let mut warnings = Vec::new();
    let mut groups: BTreeMap<String, ProductRecord> = BTreeMap::new();

    for row in rows {
        let record = match ProductRecord::try_from_row(row) {
            Ok(record) => record,
            Err(err) => {
                let warning =
                    TurnWarning::MalformedRecord { key: row_key(row), reason: err.to_string() };
                tracing::warn!(kind = warning.as_str(), ?warning, "skipping catalog row");
                warnings.push(warning);
                continue;
            }
        };
        match groups.get(&record.group_key()) {
            Some(existing) if existing.key <= record.key => {}
            _ => {
                groups.insert(record.group_key(), record);
            }
        }
    }

    let mut representatives: Vec<ProductRecord> = groups.into_values().collect();
    representatives.sort_by(|lhs, rhs| lhs.key.cmp(&rhs.key));
    let candidate_count = representatives.len();

    let mut next = memory.clone();
    let mut fresh: Vec<ProductRecord> = representatives
        .iter()
        .filter(|record| !was_shown(memory, record))
        .cloned()
        .collect();
    let exhausted = fresh.is_empty() && !representatives.is_empty();
    if exhausted {
        for record in &representatives {
            next.shown_product_keys.remove(&record.key);
            next.shown_group_keys.remove(&record.group_key());
        }
        fresh = representatives;
        tracing::debug!(candidate_count, "all candidates shown; starting a new cycle");
    }

    let mut rng = StdRng::seed_from_u64(memory.sample_seed);
    fresh.shuffle(&mut rng);
    fresh.truncate(cap);
    for record in &fresh {
        next.shown_product_keys.insert(record.key.clone());
        next.shown_group_keys.insert(record.group_key());
    }

    tracing::debug!(
        rows = rows.len(),
        candidate_count,
        sampled = fresh.len(),
        malformed = warnings.len(),
        "reduced catalog rows"
    );

    Reduction { records: fresh, memory: next, warnings, candidate_count, exhausted }
}

fn was_shown(memory: &FilterMemory, record: &ProductRecord) -> bool {
    memory.shown_product_keys.contains(&record.key)
        || memory.shown_group_keys.contains(&record.group_key())
}
