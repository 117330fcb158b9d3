//! Selection of the round winners.

use std::collections::BTreeMap;

use tracing::debug;

use swarmnet_core::{
    leaderboard::{sort_standings, Standing},
    OutputRecord,
    PeerId,
    RoundStage,
    StageOutput,
    NUM_STAGES,
};

use crate::{
    merge::{merge_stage, MergeError},
    rewards::scoring::RewardScorer,
    storage::{SwarmStorage, SwarmStore},
};

/// Ranks the contributors of the final stage's merged records.
///
/// The reward of every contribution is re-evaluated with `scorer` and summed per peer.
pub fn rank_contributors(records: &[StageOutput], scorer: &dyn RewardScorer) -> Vec<Standing> {
    let mut totals: BTreeMap<&PeerId, f64> = BTreeMap::new();
    for record in records {
        for peer_id in record.contributions().keys() {
            *totals.entry(peer_id).or_default() += scorer.score(record.stage(), record, peer_id);
        }
    }
    let mut standings: Vec<Standing> = totals
        .into_iter()
        .map(|(peer_id, score)| (peer_id.clone(), score))
        .collect();
    sort_standings(&mut standings);
    standings
}

/// The ids of the `count` best contributors of the final stage's merged records.
pub fn top_contributors(
    records: &[StageOutput],
    scorer: &dyn RewardScorer,
    count: usize,
) -> Vec<PeerId> {
    rank_contributors(records, scorer)
        .into_iter()
        .take(count)
        .map(|(peer_id, _)| peer_id)
        .collect()
}

/// Computes the winners of `round` from the outputs of its final stage.
///
/// Nothing is written to the store.
pub async fn round_winners<S>(
    store: &mut SwarmStore<S>,
    self_id: &str,
    local: Option<&OutputRecord>,
    round: u64,
    scorer: &dyn RewardScorer,
    count: usize,
) -> Result<Vec<PeerId>, MergeError>
where
    S: SwarmStorage,
{
    let final_stage = RoundStage::new(round, NUM_STAGES - 1);
    let records = merge_stage(store, self_id, local, final_stage).await?;
    debug!(
        "ranking {} merged records of {} for the round winners",
        records.len(),
        final_stage
    );
    Ok(top_contributors(&records, scorer, count))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        rewards::FormatScorer,
        storage::MemoryStore,
        utils::{Clock, ManualClock},
    };
    use swarmnet_core::{StageTwoOutput, TimedOutput};

    const DECISION: &str = "<summarize_feedback>\nall agree\n</summarize_feedback>\n\
                            <majority>\nStudent #0\n</majority>\n\
                            <question>\n2 + 2?\n</question>\n\
                            <think>\nsimple\n</think>\n\
                            <answer>\n4\n</answer>\n";

    fn decision(peer_id: &str, text: &str) -> TimedOutput {
        TimedOutput::new(
            1.,
            StageTwoOutput {
                question: "2 + 2?".into(),
                answer: "4".into(),
                stage3_prompt: None,
                final_agent_decision: vec![(peer_id.to_string(), text.to_string())]
                    .into_iter()
                    .collect(),
            },
        )
    }

    #[tokio::test]
    async fn test_round_winners_are_read_only() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0.));
        let mut store = SwarmStore::new(MemoryStore::new(clock.clone()), clock);
        let final_stage = RoundStage::new(1, 2);
        for (peer_id, reward, text) in &[
            ("strong", 1., DECISION),
            ("weak", 9., "<answer>\n5\n</answer>"),
            ("silent", 5., ""),
        ] {
            store.publish_reward(final_stage, peer_id, *reward).await.unwrap();
            if !text.is_empty() {
                store
                    .publish_output(peer_id, final_stage, &decision(peer_id, text))
                    .await
                    .unwrap();
            }
        }
        let before = store.rewards(final_stage).await.unwrap();

        let winners = round_winners(&mut store, "strong", None, 1, &FormatScorer, 2)
            .await
            .unwrap();
        assert_eq!(winners[0], "strong");
        assert_eq!(winners.len(), 2);
        assert_eq!(store.rewards(final_stage).await.unwrap(), before);
    }

    #[test]
    fn test_rank_contributors_sums_records() {
        let mut first = decision("a", DECISION).output;
        first.contributions_mut().insert("b".into(), DECISION.into());
        let second = decision("b", DECISION).output;

        let standings = rank_contributors(&[first, second], &FormatScorer);
        assert_eq!(standings[0].0, "b");
        assert!((standings[0].1 - 2. * standings[1].1).abs() < 1e-9);
    }
}
