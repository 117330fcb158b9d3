//! The round/stage orchestrator of a peer.
//!
//! Training proceeds in rounds, each split into [`NUM_STAGES`] ordered stages:
//!
//! ```text
//! Idle -> Round(r) -> Stage(r, 0) -> Stage(r, 1) -> Stage(r, 2) -> Round(r + 1) -> ... -> Done
//! ```
//!
//! Exactly one peer of a swarm is the **coordinator**. It owns the shared round/stage counter:
//! when it enters a stage it publishes the new `(round, stage)` to the store, and after the final
//! stage of a round it computes the round winners and submits them to the external coordinator
//! service. It stops after `max_rounds` rounds.
//!
//! All other peers are **followers**. They poll the counter and, whenever it shows a round they
//! have not trained yet, train that round starting at the observed stage. A follower may join in
//! the middle of a round. Polling is retried at a fixed short interval while the counter is
//! unreadable and backs off exponentially while the counter still shows a finished round.
//!
//! Every stage runs in three steps:
//!
//! 1. Its input is prepared: the dataset for stage 0, the merged outputs of the previous stage
//!    otherwise (see [`merge`]). If the participants of the previous stage are unknown, a
//!    follower that joined in the middle of a round retries the whole round from stage 0 once.
//! 2. The [`TrainingStep`] runs. Its progress is published through a [`StagePublisher`]. A
//!    transient failure is retried up to `max_train_fails` times with a pause in between.
//! 3. Unpublished progress is flushed.
//!
//! The whole run is bounded by the `train_timeout`.
//!
//! [`merge`]: crate::merge
//! [`StagePublisher`]: crate::rewards::StagePublisher

pub mod peer;
pub mod training;

#[cfg(test)]
mod tests;

use std::{cmp::min, sync::Arc, time::Duration};

use rand::{rngs::StdRng, SeedableRng};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, error_span, info, warn, Instrument};

use swarmnet_core::{RoundStage, NUM_STAGES};

pub use self::{
    peer::{Peer, PeerState},
    training::{
        default_dataset,
        load_dataset,
        DatasetError,
        DryRunTrainer,
        Progress,
        ProgressSink,
        StageInput,
        TrainingError,
        TrainingStep,
    },
};
use crate::{
    coordinator::{CoordinatorError, SwarmCoordinator},
    merge::{build_samples, merge_previous_stage, MergeError, StageSample},
    rewards::{round_winners, RewardScorer, StagePublisher},
    settings::{CounterSource, MergeSettings, PollingSettings, TrainingSettings},
    storage::{StorageError, SwarmStorage, SwarmStore},
};

/// The role of a peer in the swarm.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Advances the round/stage counter and submits the round winners.
    Coordinator,
    /// Follows the round/stage counter.
    Follower,
}

/// Error that ends the training of a peer.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("preparing the stage input failed: {0}")]
    Merge(#[from] MergeError),

    #[error("training step failed: {0}")]
    Training(#[from] TrainingError),

    #[error("store request failed: {0}")]
    Storage(#[from] StorageError),

    #[error("coordinator request failed: {0}")]
    Coordinator(#[from] CoordinatorError),
}

/// The settings the orchestrator runs with.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub training: TrainingSettings,
    pub polling: PollingSettings,
    pub merge: MergeSettings,
}

/// Drives a peer through the training schedule.
pub struct Orchestrator<S, T> {
    peer: Peer,
    store: SwarmStore<S>,
    trainer: T,
    coordinator: Arc<dyn SwarmCoordinator>,
    scorer: Arc<dyn RewardScorer>,
    settings: OrchestratorSettings,
    dataset: Vec<StageSample>,
    rng: StdRng,
}

impl<S, T> Orchestrator<S, T>
where
    S: SwarmStorage,
    T: TrainingStep,
{
    /// Creates an orchestrator for `peer`. `dataset` holds the samples of stage 0.
    pub fn new(
        peer: Peer,
        store: SwarmStore<S>,
        trainer: T,
        coordinator: Arc<dyn SwarmCoordinator>,
        scorer: Arc<dyn RewardScorer>,
        settings: OrchestratorSettings,
        dataset: Vec<StageSample>,
    ) -> Self {
        Self {
            peer,
            store,
            trainer,
            coordinator,
            scorer,
            settings,
            dataset,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Registers the peer and trains until the schedule is complete or the training times out.
    ///
    /// # Errors
    /// Fails on the first unrecoverable error, which is logged before it is returned.
    pub async fn run(&mut self) -> Result<(), OrchestratorError> {
        let span = error_span!("peer", id = %self.peer.id, role = ?self.peer.role());
        async move {
            self.coordinator.register_peer(&self.peer.id).await?;

            let train_timeout = self.settings.training.train_timeout();
            let result = match self.peer.role() {
                Role::Coordinator => timeout(train_timeout, self.coordinator_train()).await,
                Role::Follower => timeout(train_timeout, self.follower_train()).await,
            };
            match result {
                Ok(Ok(())) => info!("training finished"),
                Ok(Err(err)) => {
                    error!("training failed: {}", err);
                    return Err(err);
                }
                Err(_) => info!("training timed out"),
            }
            self.peer.finish();
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn coordinator_train(&mut self) -> Result<(), OrchestratorError> {
        for round in 0..self.settings.training.max_rounds {
            info!("starting new round: {}", round);
            self.train_round(round, 0).await?;
        }
        Ok(())
    }

    async fn follower_train(&mut self) -> Result<(), OrchestratorError> {
        let polling = self.settings.polling;
        let max_rounds = self.settings.training.max_rounds;
        let mut last_done: Option<u64> = None;
        let mut backoff = polling.check_interval();
        let mut last_log: Option<Instant> = None;

        loop {
            let round_stage = match self.observe_round_and_stage().await {
                Ok(Some(round_stage)) => round_stage,
                outcome => {
                    let now = Instant::now();
                    if last_log.map_or(true, |last| now - last >= polling.log_timeout()) {
                        match outcome {
                            Err(err) => debug!(
                                "could not fetch the round and stage: {}. next check in {:?}",
                                err,
                                polling.check_interval()
                            ),
                            _ => debug!(
                                "the round and stage are not published yet. next check in {:?}",
                                polling.check_interval()
                            ),
                        }
                        last_log = Some(now);
                    }
                    sleep(polling.check_interval()).await;
                    continue;
                }
            };

            // lagging replicas of the counter may report rounds that were already trained
            if let Some(done) = last_done.filter(|done| round_stage.round <= *done) {
                info!(
                    "round {} is not ahead of finished round {}. next check in {:?}",
                    round_stage.round, done, backoff
                );
                sleep(backoff).await;
                backoff = next_backoff(backoff, polling.max_check_interval());
            } else {
                info!(
                    "joining round {} starting at stage {}",
                    round_stage.round, round_stage.stage
                );
                self.train_round(round_stage.round, round_stage.stage)
                    .await?;
                last_done = Some(round_stage.round);
                backoff = polling.check_interval();
            }

            if round_stage.round + 1 >= max_rounds {
                return Ok(());
            }
        }
    }

    /// Reads the round/stage counter from the configured source.
    async fn observe_round_and_stage(&mut self) -> Result<Option<RoundStage>, OrchestratorError> {
        match self.settings.training.follow {
            CounterSource::Store => Ok(self.store.round_and_stage().await?),
            CounterSource::Coordinator => match self.coordinator.get_round_and_stage().await {
                Ok(round_stage) => Ok(Some(round_stage)),
                Err(CoordinatorError::NoRoundAndStage) => Ok(None),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Trains a round from `start_stage` on, retrying it from stage 0 once if a later stage lacks
    /// the data of its previous stage.
    async fn train_round(&mut self, round: u64, start_stage: u64) -> Result<(), OrchestratorError> {
        self.peer.start_round(round);
        let result = match self.train_stages(round, start_stage).await {
            Err(OrchestratorError::Merge(err)) if err.is_missing_data() && start_stage > 0 => {
                warn!("{}. re-attempting round {} from stage 0", err, round);
                self.train_stages(round, 0).await
            }
            result => result,
        };
        result?;

        if self.peer.is_coordinator() {
            self.submit_winners(round).await?;
        }

        self.peer.clear_cache();
        self.trainer.cleanup();
        Ok(())
    }

    async fn train_stages(&mut self, round: u64, start_stage: u64) -> Result<(), OrchestratorError> {
        for stage in start_stage..NUM_STAGES {
            let round_stage = RoundStage::new(round, stage);
            let span = error_span!("stage", round, stage);
            self.train_stage(round_stage).instrument(span).await?;
        }
        Ok(())
    }

    async fn train_stage(&mut self, round_stage: RoundStage) -> Result<(), OrchestratorError> {
        self.peer.enter_stage(round_stage);
        if self.peer.is_coordinator() {
            self.store.publish_round_and_stage(round_stage).await?;
        }

        info!("training round {} stage {}", round_stage.round, round_stage.stage);
        let input = self.prepare_input(round_stage).await?;
        debug!("prepared {} samples", input.samples.len());

        let max_train_fails = self.settings.training.max_train_fails;
        let mut fails = 0;
        loop {
            let mut publisher = StagePublisher::new(&mut self.store, &mut self.peer);
            match self.trainer.train(&input, &mut publisher).await {
                Ok(()) => {
                    publisher.flush().await?;
                    break;
                }
                Err(err) if err.is_transient() && fails + 1 < max_train_fails => {
                    fails += 1;
                    warn!(
                        "transient training failure ({}/{}): {}. restarting training",
                        fails, max_train_fails, err
                    );
                    self.trainer.cleanup();
                    self.peer.rewards_mut().reset();
                    sleep(self.settings.training.train_retry_pause()).await;
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!(
            "finished training round {} stage {}",
            round_stage.round, round_stage.stage
        );
        Ok(())
    }

    async fn prepare_input(&mut self, round_stage: RoundStage) -> Result<StageInput, MergeError> {
        let samples = match round_stage.previous_in_round() {
            None => self.dataset.clone(),
            Some(previous) => {
                let local = self.peer.stage_outputs(previous);
                let records =
                    merge_previous_stage(&mut self.store, &self.peer.id, local, round_stage)
                        .await?;
                let scorer = self.scorer.clone();
                build_samples(
                    records,
                    &self.settings.merge,
                    |record, peer_id| scorer.score(record.stage(), record, peer_id),
                    &mut self.rng,
                )
            }
        };
        Ok(StageInput {
            round_stage,
            samples,
        })
    }

    async fn submit_winners(&mut self, round: u64) -> Result<(), OrchestratorError> {
        let final_stage = RoundStage::new(round, NUM_STAGES - 1);
        let local = self.peer.stage_outputs(final_stage);
        let winners = match round_winners(
            &mut self.store,
            &self.peer.id,
            local,
            round,
            self.scorer.as_ref(),
            self.settings.training.winners,
        )
        .await
        {
            Ok(winners) => winners,
            Err(err) if err.is_missing_data() => {
                warn!("no winners for round {}: {}", round, err);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        info!("submitting winners for round {}: {:?}", round, winners);
        self.coordinator.submit_winners(round, &winners).await?;
        Ok(())
    }
}

/// Doubles the backoff, up to `max`.
fn next_backoff(backoff: Duration, max: Duration) -> Duration {
    min(backoff * 2, max)
}
