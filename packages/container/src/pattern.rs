// ABOUTME: Service pattern classification
// ABOUTME: Splits finalized services into shared singletons and agreement-private services

use std::collections::BTreeMap;

use crate::deployment::{Pattern, SINGLETON};
use crate::finalize::ServicePair;

/// Partition `pairs` into `(shared, private)` by the pattern's singleton list.
pub fn classify(
    pairs: BTreeMap<String, ServicePair>,
    pattern: &Pattern,
) -> (BTreeMap<String, ServicePair>, BTreeMap<String, ServicePair>) {
    pairs
        .into_iter()
        .partition(|(name, _)| pattern.is_shared(SINGLETON, name))
}
