//! Typed access to the shared records.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::anyhow;
use serde_json::Value;
use tracing::warn;

use swarmnet_core::{
    hash::question_hash,
    leaderboard::Standing,
    OutputRecord,
    PeerId,
    RewardRecord,
    RoundStage,
    TimedOutput,
};

use crate::{
    storage::{
        keys::{leaderboard_key, outputs_key, rewards_key, ROUND_STAGE_NUMBER_KEY},
        ReadOptions,
        StorageResult,
        StoreValue,
        SwarmStorage,
    },
    utils::Clock,
};

/// The default lifetime of published values, in seconds.
pub const DEFAULT_EXPIRATION: f64 = 4. * 3600.;

#[derive(Clone, Debug)]
/// The shared records of the swarm on top of a [`SwarmStorage`].
pub struct SwarmStore<S> {
    storage: S,
    clock: Arc<dyn Clock>,
    options: ReadOptions,
    expiration: f64,
}

impl<S> SwarmStore<S>
where
    S: SwarmStorage,
{
    /// Creates a new [`SwarmStore`] that publishes values living for [`DEFAULT_EXPIRATION`].
    pub fn new(storage: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            options: ReadOptions::default(),
            expiration: DEFAULT_EXPIRATION,
        }
    }

    /// Sets the lifetime of published values, in seconds.
    pub fn with_expiration(mut self, seconds: f64) -> Self {
        self.expiration = seconds;
        self
    }

    /// Sets the read hints used for every read.
    pub fn with_read_options(mut self, options: ReadOptions) -> Self {
        self.options = options;
        self
    }

    /// The current store time.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// The underlying storage.
    pub fn storage(&mut self) -> &mut S {
        &mut self.storage
    }

    fn expiration_time(&self) -> f64 {
        self.clock.now() + self.expiration
    }

    async fn get(&mut self, key: &str) -> StorageResult<Option<StoreValue>> {
        let options = self.options;
        self.storage.get(key, None, options).await
    }

    async fn get_entries(&mut self, key: &str) -> StorageResult<Option<BTreeMap<String, Value>>> {
        match self.get(key).await? {
            Some(StoreValue::Entries(entries)) => Ok(Some(entries)),
            Some(StoreValue::Single(_)) => {
                warn!("expected sub-entries under {}, found a single value", key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Reads the round/stage counter.
    pub async fn round_and_stage(&mut self) -> StorageResult<Option<RoundStage>> {
        match self.get(ROUND_STAGE_NUMBER_KEY).await? {
            Some(StoreValue::Single(value)) => Ok(Some(serde_json::from_value(value)?)),
            Some(StoreValue::Entries(_)) => Err(anyhow!(
                "the round/stage counter {} holds sub-entries",
                ROUND_STAGE_NUMBER_KEY
            )),
            None => Ok(None),
        }
    }

    /// Publishes the round/stage counter.
    pub async fn publish_round_and_stage(&mut self, round_stage: RoundStage) -> StorageResult<()> {
        let expiration = self.expiration_time();
        self.storage
            .put(
                ROUND_STAGE_NUMBER_KEY,
                None,
                serde_json::to_value(round_stage)?,
                expiration,
            )
            .await
    }

    /// Reads the reward record of a `(round, stage)`.
    ///
    /// Entries that are not numbers are skipped.
    pub async fn rewards(&mut self, round_stage: RoundStage) -> StorageResult<Option<RewardRecord>> {
        let key = rewards_key(round_stage);
        let entries = match self.get_entries(&key).await? {
            Some(entries) => entries,
            None => return Ok(None),
        };
        let record: RewardRecord = entries
            .into_iter()
            .filter_map(|(peer_id, value)| match value.as_f64() {
                Some(reward) => Some((peer_id, reward)),
                None => {
                    warn!("ignoring non-numeric reward of {} under {}", peer_id, key);
                    None
                }
            })
            .collect();
        Ok(Some(record))
    }

    /// Publishes the cumulative reward of a peer for a `(round, stage)`.
    pub async fn publish_reward(
        &mut self,
        round_stage: RoundStage,
        peer_id: &str,
        reward: f64,
    ) -> StorageResult<()> {
        let expiration = self.expiration_time();
        self.storage
            .put(
                &rewards_key(round_stage),
                Some(peer_id),
                Value::from(reward),
                expiration,
            )
            .await
    }

    /// Reads the output record of a peer for a `(round, stage)`.
    ///
    /// Entries that do not decode as outputs of that stage are skipped.
    pub async fn outputs(
        &mut self,
        peer_id: &str,
        round_stage: RoundStage,
    ) -> StorageResult<Option<OutputRecord>> {
        let key = outputs_key(peer_id, round_stage);
        let entries = match self.get_entries(&key).await? {
            Some(entries) => entries,
            None => return Ok(None),
        };
        let record: OutputRecord = entries
            .into_iter()
            .filter_map(
                |(hash, value)| match TimedOutput::from_value(round_stage.stage, value) {
                    Ok(output) => Some((hash, output)),
                    Err(err) => {
                        warn!("ignoring output {} under {}: {}", hash, key, err);
                        None
                    }
                },
            )
            .collect();
        Ok(Some(record))
    }

    /// Publishes one output of a peer, under the hash of its question.
    pub async fn publish_output(
        &mut self,
        peer_id: &str,
        round_stage: RoundStage,
        output: &TimedOutput,
    ) -> StorageResult<()> {
        let expiration = self.expiration_time();
        let subkey = question_hash(output.output.question());
        self.storage
            .put(
                &outputs_key(peer_id, round_stage),
                Some(&subkey),
                serde_json::to_value(output)?,
                expiration,
            )
            .await
    }

    /// Reads the published leaderboard of a `(round, stage)`.
    pub async fn leaderboard(
        &mut self,
        round_stage: RoundStage,
    ) -> StorageResult<Option<Vec<Standing>>> {
        match self.get(&leaderboard_key(round_stage)).await? {
            Some(StoreValue::Single(value)) => Ok(Some(serde_json::from_value(value)?)),
            _ => Ok(None),
        }
    }

    /// Publishes the sorted leaderboard of a `(round, stage)`.
    pub async fn publish_leaderboard(
        &mut self,
        round_stage: RoundStage,
        standings: &[Standing],
    ) -> StorageResult<()> {
        let expiration = self.expiration_time();
        self.storage
            .put(
                &leaderboard_key(round_stage),
                None,
                serde_json::to_value(standings)?,
                expiration,
            )
            .await
    }

    /// The peers with a reward entry for a `(round, stage)`.
    pub async fn participants(
        &mut self,
        round_stage: RoundStage,
    ) -> StorageResult<Option<Vec<PeerId>>> {
        Ok(self
            .rewards(round_stage)
            .await?
            .map(|record| record.into_keys().collect()))
    }
}
