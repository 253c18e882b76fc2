use std::collections::HashSet;

/// What to do with one message batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Classify these ids (batch order preserved)
    Send(Vec<i64>),
    /// Every message already has a classification row
    SkipAllExisting,
}

/// Drop ids that already have a row, unless `force` is set.
pub fn guard(batch_ids: &[i64], existing_ids: &HashSet<i64>, force: bool) -> GuardDecision {
    let to_send: Vec<i64> = if force {
        batch_ids.to_vec()
    } else {
        batch_ids
            .iter()
            .copied()
            .filter(|id| !existing_ids.contains(id))
            .collect()
    };
    if to_send.is_empty() {
        GuardDecision::SkipAllExisting
    } else {
        GuardDecision::Send(to_send)
    }
}
