//! Accumulation and publication of rewards.
//!
//! A stage's training step reports its progress in increments. Each increment carries the rewards
//! of the examples it trained on and, usually, one output object. The peer sums the rewards of all
//! increments of the stage and publishes the running total, never a delta, so the reward record of
//! a stage always holds the cumulative reward of every peer. To bound the write volume the total
//! is published on the first increment and then every `cadence` increments. Whatever is left
//! unpublished when the training step returns is flushed.
//!
//! The coordinator also derives the sorted leaderboard of the stage after every publish.

pub mod scoring;
pub mod winners;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use swarmnet_core::{
    hash::question_hash,
    leaderboard::{rank, Standing},
    QuestionHash,
    RoundStage,
    TimedOutput,
};

pub use self::{
    scoring::{extract_tag, FormatScorer, RewardScorer},
    winners::{rank_contributors, round_winners, top_contributors},
};
use crate::{
    state_machine::{
        peer::Peer,
        training::{Progress, ProgressSink, TrainingError},
    },
    storage::{StorageResult, SwarmStorage, SwarmStore},
};

/// The running reward of a peer during one stage.
#[derive(Clone, Debug, PartialEq)]
pub struct RewardAccumulator {
    cadence: u64,
    total: f64,
    increments: u64,
    published: u64,
}

impl RewardAccumulator {
    /// Creates an accumulator that asks for a publish every `cadence` increments.
    pub fn new(cadence: u64) -> Self {
        Self {
            cadence: cadence.max(1),
            total: 0.,
            increments: 0,
            published: 0,
        }
    }

    /// Adds the rewards of one increment.
    ///
    /// Returns `true` if the total is due to be published.
    pub fn add(&mut self, rewards: &[f64]) -> bool {
        let step = self.increments;
        self.increments += 1;
        self.total += rewards.iter().sum::<f64>();
        step % self.cadence == 0
    }

    /// The cumulative reward of the stage so far.
    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn increments(&self) -> u64 {
        self.increments
    }

    /// Checks whether increments were added since the last publish.
    pub fn is_dirty(&self) -> bool {
        self.published < self.increments
    }

    pub fn mark_published(&mut self) {
        self.published = self.increments;
    }

    /// Starts over for a new stage.
    pub fn reset(&mut self) {
        *self = Self::new(self.cadence);
    }
}

/// Derives the leaderboard of `round_stage` from its reward record and publishes it.
///
/// Returns `None` without publishing if the reward record is absent.
pub async fn publish_leaderboard<S>(
    store: &mut SwarmStore<S>,
    round_stage: RoundStage,
) -> StorageResult<Option<Vec<Standing>>>
where
    S: SwarmStorage,
{
    let record = match store.rewards(round_stage).await? {
        Some(record) => record,
        None => {
            debug!("no rewards for {}, skipping the leaderboard", round_stage);
            return Ok(None);
        }
    };
    let standings = rank(&record);
    store.publish_leaderboard(round_stage, &standings).await?;
    Ok(Some(standings))
}

/// Receives the progress of a training step and publishes it for a peer.
///
/// Every output is kept in the peer's local cache right away. Outputs and the cumulative reward
/// reach the store whenever the peer's [`RewardAccumulator`] asks for it and on [`flush()`].
///
/// [`flush()`]: StagePublisher::flush
pub struct StagePublisher<'a, S> {
    store: &'a mut SwarmStore<S>,
    peer: &'a mut Peer,
    pending: BTreeMap<QuestionHash, TimedOutput>,
}

impl<'a, S> StagePublisher<'a, S>
where
    S: SwarmStorage,
{
    pub fn new(store: &'a mut SwarmStore<S>, peer: &'a mut Peer) -> Self {
        Self {
            store,
            peer,
            pending: BTreeMap::new(),
        }
    }

    /// Publishes whatever was not published yet.
    pub async fn flush(&mut self) -> StorageResult<()> {
        if self.peer.rewards().is_dirty() || !self.pending.is_empty() {
            self.publish().await?;
        }
        Ok(())
    }

    async fn publish(&mut self) -> StorageResult<()> {
        let round_stage = self.peer.round_stage();
        for output in self.pending.values() {
            self.store
                .publish_output(&self.peer.id, round_stage, output)
                .await?;
        }
        self.pending.clear();

        let total = self.peer.rewards().total();
        self.store
            .publish_reward(round_stage, &self.peer.id, total)
            .await?;
        self.peer.rewards_mut().mark_published();
        debug!("published a cumulative reward of {} for {}", total, round_stage);

        if self.peer.is_coordinator() {
            publish_leaderboard(&mut *self.store, round_stage).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<'a, S> ProgressSink for StagePublisher<'a, S>
where
    S: SwarmStorage,
{
    async fn report(&mut self, progress: Progress) -> Result<(), TrainingError> {
        let round_stage = self.peer.round_stage();
        if let Some(output) = progress.output {
            let output = TimedOutput::new(self.store.now(), output);
            let hash = question_hash(output.output.question());
            self.peer
                .put_stage_output(round_stage, hash.clone(), output.clone());
            self.pending.insert(hash, output);
        }
        if self.peer.rewards_mut().add(&progress.rewards) {
            self.publish().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        state_machine::Role,
        storage::MemoryStore,
        utils::{Clock, ManualClock},
    };
    use swarmnet_core::{StageOutput, StageZeroOutput};

    fn store() -> SwarmStore<MemoryStore> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(10.));
        SwarmStore::new(MemoryStore::new(clock.clone()), clock)
    }

    fn output(question: &str) -> Option<StageOutput> {
        Some(StageOutput::from(StageZeroOutput {
            question: question.into(),
            answer: "4".into(),
            agent_answers: Default::default(),
        }))
    }

    #[test]
    fn test_accumulator_cadence() {
        let mut rewards = RewardAccumulator::new(3);
        let due: Vec<bool> = (0..7).map(|_| rewards.add(&[0.5, 0.5])).collect();
        assert_eq!(due, vec![true, false, false, true, false, false, true]);
        assert_eq!(rewards.total(), 7.);
        assert!(rewards.is_dirty());
        rewards.mark_published();
        assert!(!rewards.is_dirty());

        rewards.reset();
        assert_eq!(rewards.total(), 0.);
        assert_eq!(rewards.increments(), 0);
        assert!(rewards.add(&[]));
    }

    #[tokio::test]
    async fn test_publisher_throttles_and_flushes() {
        let mut store = store();
        let mut peer = Peer::new("follower", Role::Follower, 4);
        let rs = RoundStage::new(0, 0);
        peer.enter_stage(rs);

        let mut publisher = StagePublisher::new(&mut store, &mut peer);
        for (i, reward) in [1., 2., 3.].iter().enumerate() {
            let progress = Progress {
                rewards: vec![*reward],
                output: output(&format!("q{}", i)),
            };
            publisher.report(progress).await.unwrap();
        }
        drop(publisher);

        // only the first increment was published
        assert_eq!(store.rewards(rs).await.unwrap().unwrap()["follower"], 1.);
        assert_eq!(store.outputs("follower", rs).await.unwrap().unwrap().len(), 1);
        assert_eq!(peer.stage_outputs(rs).unwrap().len(), 3);

        StagePublisher::new(&mut store, &mut peer).flush().await.unwrap();
        assert_eq!(store.rewards(rs).await.unwrap().unwrap()["follower"], 6.);
        // the pending outputs of the dropped publisher are lost, the local cache keeps them
        assert_eq!(store.outputs("follower", rs).await.unwrap().unwrap().len(), 1);
        assert_eq!(store.leaderboard(rs).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_coordinator_publishes_leaderboard() {
        let mut store = store();
        let rs = RoundStage::new(1, 1);
        store.publish_reward(rs, "peerHigh", 20.).await.unwrap();

        let mut peer = Peer::new("peerLow", Role::Coordinator, 4);
        peer.enter_stage(rs);
        let mut publisher = StagePublisher::new(&mut store, &mut peer);
        publisher
            .report(Progress {
                rewards: vec![4., 6.],
                output: output("q"),
            })
            .await
            .unwrap();
        publisher.flush().await.unwrap();

        assert_eq!(
            store.leaderboard(rs).await.unwrap(),
            Some(vec![("peerHigh".to_string(), 20.), ("peerLow".to_string(), 10.)])
        );
    }

    #[tokio::test]
    async fn test_leaderboard_needs_rewards() {
        let mut store = store();
        let rs = RoundStage::new(0, 1);
        assert_eq!(publish_leaderboard(&mut store, rs).await.unwrap(), None);
        assert_eq!(store.leaderboard(rs).await.unwrap(), None);
    }
}
