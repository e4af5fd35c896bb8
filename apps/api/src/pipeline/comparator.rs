use std::collections::BTreeSet;

use crate::models::activity::ActivitySnapshot;

/// Returns the users needing (re)segmentation.
///
/// A user is dirty when absent from the baseline or when either counter
/// strictly increased. Equal counts are never dirty, so unchanged users do
/// not flap back into the queue. No baseline means every user is dirty.
pub fn diff(current: &ActivitySnapshot, baseline: Option<&ActivitySnapshot>) -> BTreeSet<String> {
    current
        .users
        .iter()
        .filter(|(user_id, now)| match baseline.and_then(|b| b.get(user_id)) {
            None => true,
            Some(before) => {
                now.event_count > before.event_count || now.order_count > before.order_count
            }
        })
        .map(|(user_id, _)| user_id.clone())
        .collect()
}
