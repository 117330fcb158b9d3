//! Leaderboard ordering and the leaderboard shapes served to dashboards.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::common::{PeerId, RewardRecord};

/// A peer together with its score.
pub type Standing = (PeerId, f64);

/// Compares two standings so that sorting yields `(score, peer_id)` in descending order.
pub fn compare_standings(a: &Standing, b: &Standing) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0))
}

/// Sorts standings by `(score, peer_id)` in descending order.
///
/// The result depends only on the set of standings, never on their input order.
pub fn sort_standings(standings: &mut [Standing]) {
    standings.sort_by(compare_standings);
}

/// Ranks the peers of a reward record.
pub fn rank(record: &RewardRecord) -> Vec<Standing> {
    let mut standings: Vec<Standing> = record
        .iter()
        .map(|(peer_id, score)| (peer_id.clone(), *score))
        .collect();
    sort_standings(&mut standings);
    standings
}

/// One point of a score time series.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScorePoint {
    /// Unix timestamp in seconds.
    pub x: i64,
    pub y: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub id: PeerId,
    pub nickname: String,
    pub score: f64,
    pub values: Vec<ScorePoint>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RewardsHistory {
    pub id: PeerId,
    pub nickname: String,
    pub values: Vec<ScorePoint>,
}

/// A snapshot of the current `(round, stage)` rewards.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboard {
    pub leaders: Vec<LeaderboardEntry>,
    pub total: usize,
    pub rewards_history: Vec<RewardsHistory>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeEntry {
    pub id: PeerId,
    pub nickname: String,
    pub recorded_round: u64,
    pub recorded_stage: u64,
    pub cumulative_score: f64,
    pub last_score: f64,
    pub score_history: Vec<ScorePoint>,
}

/// Running totals across stages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeLeaderboard {
    pub leaders: Vec<CumulativeEntry>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(entries: &[(&str, f64)]) -> RewardRecord {
        entries
            .iter()
            .map(|(id, score)| (id.to_string(), *score))
            .collect()
    }

    #[test]
    fn test_rank() {
        let ranked = rank(&record(&[("peerLow", 10.), ("peerHigh", 20.)]));
        assert_eq!(
            ranked,
            vec![("peerHigh".to_string(), 20.), ("peerLow".to_string(), 10.)]
        );
    }

    #[test]
    fn test_rank_breaks_ties_on_id() {
        let ranked = rank(&record(&[("a", 1.), ("c", 1.), ("b", 1.), ("d", 0.5)]));
        let ids: Vec<&str> = ranked.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn test_sort_is_idempotent() {
        let mut standings = rank(&record(&[("x", 3.), ("y", -1.), ("z", 3.), ("w", 7.25)]));
        let sorted = standings.clone();
        sort_standings(&mut standings);
        assert_eq!(standings, sorted);

        let mut reversed: Vec<Standing> = sorted.iter().rev().cloned().collect();
        sort_standings(&mut reversed);
        assert_eq!(reversed, sorted);
    }
}
