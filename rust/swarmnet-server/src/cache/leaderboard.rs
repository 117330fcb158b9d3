//! Leaderboards derived from the reward record of the current `(round, stage)`.

use std::collections::BTreeMap;

use tracing::debug;

use swarmnet_core::{
    leaderboard::{
        rank,
        CumulativeEntry,
        CumulativeLeaderboard,
        Leaderboard,
        LeaderboardEntry,
        RewardsHistory,
        ScorePoint,
    },
    names::NameCache,
    PeerId,
    RewardRecord,
    RoundStage,
};

/// Appends `point` to `values`, keeping at most the last `len` points.
fn push_capped(values: &mut Vec<ScorePoint>, point: ScorePoint, len: usize) {
    values.push(point);
    if values.len() > len {
        let excess = values.len() - len;
        values.drain(..excess);
    }
}

/// Derives the snapshot leaderboard of `record`.
///
/// Every call adds one point per peer to `history`. Peers missing from `record` lose their
/// history.
pub fn simple_leaderboard(
    record: &RewardRecord,
    history: &mut BTreeMap<PeerId, Vec<ScorePoint>>,
    now: i64,
    history_len: usize,
    names: &NameCache,
) -> Leaderboard {
    history.retain(|peer_id, _| record.contains_key(peer_id));

    let mut leaders = Vec::with_capacity(record.len());
    let mut rewards_history = Vec::with_capacity(record.len());
    for (id, score) in rank(record) {
        let values = history.entry(id.clone()).or_default();
        push_capped(values, ScorePoint { x: now, y: score }, history_len);
        let nickname = names.get(&id);
        rewards_history.push(RewardsHistory {
            id: id.clone(),
            nickname: nickname.clone(),
            values: values.clone(),
        });
        leaders.push(LeaderboardEntry {
            id,
            nickname,
            score,
            values: values.clone(),
        });
    }

    Leaderboard {
        total: leaders.len(),
        leaders,
        rewards_history,
    }
}

/// Folds `record`, the rewards of `round_stage`, into the running totals of `leaderboard`.
///
/// A peer's reward is added to its total once per `(round, stage)`: while the peer is still
/// recorded at `round_stage` its last reward is replaced instead. Peers recorded neither at
/// `round_stage` nor at the position before it are dropped.
pub fn update_cumulative(
    leaderboard: &mut CumulativeLeaderboard,
    record: &RewardRecord,
    round_stage: RoundStage,
    now: i64,
    history_len: usize,
    names: &NameCache,
) {
    let mut entries: BTreeMap<PeerId, CumulativeEntry> = leaderboard
        .leaders
        .drain(..)
        .map(|entry| (entry.id.clone(), entry))
        .collect();

    for (peer_id, score) in record {
        let entry = entries
            .entry(peer_id.clone())
            .or_insert_with(|| CumulativeEntry {
                id: peer_id.clone(),
                nickname: names.get(peer_id),
                recorded_round: round_stage.round,
                recorded_stage: round_stage.stage,
                cumulative_score: 0.,
                last_score: 0.,
                score_history: Vec::new(),
            });
        if recorded_at(entry) == round_stage {
            entry.cumulative_score += score - entry.last_score;
        } else {
            entry.cumulative_score += score;
            entry.recorded_round = round_stage.round;
            entry.recorded_stage = round_stage.stage;
        }
        entry.last_score = *score;
        let point = ScorePoint {
            x: now,
            y: entry.cumulative_score,
        };
        push_capped(&mut entry.score_history, point, history_len);
    }

    let previous = round_stage.previous();
    entries.retain(|peer_id, entry| {
        let recorded = recorded_at(entry);
        let keep = recorded == round_stage || recorded == previous;
        if !keep {
            debug!(
                "dropping {} from the cumulative leaderboard, last seen at {}",
                peer_id, recorded
            );
        }
        keep
    });

    let mut leaders: Vec<CumulativeEntry> = entries.into_values().collect();
    leaders.sort_by(|a, b| {
        b.cumulative_score
            .total_cmp(&a.cumulative_score)
            .then_with(|| b.id.cmp(&a.id))
    });
    leaderboard.total = leaders.len();
    leaderboard.leaders = leaders;
}

fn recorded_at(entry: &CumulativeEntry) -> RoundStage {
    RoundStage::new(entry.recorded_round, entry.recorded_stage)
}
