//! Sub-sampling of contributions.

use std::cmp::Ordering;

use rand::{seq::IteratorRandom, Rng};
use serde::Deserialize;

use swarmnet_core::{ContentHash, PeerId};

/// How the contributions of a merged record are picked when they are too many for one prompt.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Keep every contribution.
    All,
    /// Pick contributions uniformly at random.
    Random,
    /// Keep the best scored contributions.
    TopK,
}

impl Default for Selection {
    fn default() -> Self {
        Self::All
    }
}

/// Picks at most `limit` contributions.
///
/// The result is ordered by peer id. With [`Selection::TopK`] the contributions are ranked by
/// `score` descending and equal scores are ordered by the hash of the peer id, so the outcome
/// never depends on the iteration order of the input.
pub fn select_contributions<'a, I, F, R>(
    contributions: I,
    selection: Selection,
    limit: Option<usize>,
    mut score: F,
    rng: &mut R,
) -> Vec<(&'a PeerId, &'a String)>
where
    I: IntoIterator<Item = (&'a PeerId, &'a String)>,
    F: FnMut(&str, &str) -> f64,
    R: Rng + ?Sized,
{
    let contributions = contributions.into_iter();
    let mut selected = match (selection, limit) {
        (Selection::All, _) | (_, None) => contributions.collect::<Vec<_>>(),
        (Selection::Random, Some(limit)) => contributions.choose_multiple(rng, limit),
        (Selection::TopK, Some(limit)) => {
            let mut ranked = contributions
                .map(|(peer_id, value)| {
                    let rank = (score(peer_id, value), ContentHash::digest(peer_id));
                    (rank, (peer_id, value))
                })
                .collect::<Vec<_>>();
            ranked.sort_by(|(a, _), (b, _)| match b.0.total_cmp(&a.0) {
                Ordering::Equal => b.1.cmp(&a.1),
                ordering => ordering,
            });
            ranked
                .into_iter()
                .take(limit)
                .map(|(_, contribution)| contribution)
                .collect()
        }
    };
    selected.sort_by(|a, b| a.0.cmp(b.0));
    selected
}
