//! Reward ranking helpers.

use std::cmp::Ordering;

use crate::variable::Rewarded;

fn by_reward_desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable sort by reward, highest first, unscored items last.
pub fn rank_by_reward<T: Rewarded + Clone>(items: &[T]) -> Vec<T> {
    let mut ranked = items.to_vec();
    ranked.sort_by(|a, b| by_reward_desc(a.reward(), b.reward()));
    ranked
}

/// The `k` best items by reward.
pub fn top_k<T: Rewarded + Clone>(items: &[T], k: usize) -> Vec<T> {
    let mut ranked = rank_by_reward(items);
    ranked.truncate(k);
    ranked
}
