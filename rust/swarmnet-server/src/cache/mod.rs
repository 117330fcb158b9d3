//! The read-side cache of the dashboard.
//!
//! A [`CachePoller`] periodically reads the round/stage counter and the reward record of the
//! current `(round, stage)` and derives the views served by the [REST API]: a snapshot
//! leaderboard, a cumulative leaderboard and a gossip feed. Every view of one poll is written
//! under a single lock, so readers of the [`SwarmCache`] never see a partial update.
//!
//! [REST API]: crate::rest

pub mod gossip;
pub mod leaderboard;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, error, error_span, info, Instrument};

use swarmnet_core::{
    gossip::GossipFeed,
    leaderboard::{CumulativeLeaderboard, Leaderboard, ScorePoint},
    names::NameCache,
    PeerId,
    RoundStage,
};

use self::{
    gossip::GossipSampler,
    leaderboard::{simple_leaderboard, update_cumulative},
};
use crate::{
    coordinator::{CoordinatorError, SwarmCoordinator},
    settings::CacheSettings,
    storage::{StorageError, SwarmStorage, SwarmStore},
    utils::Clock,
};

/// Error of a single poll.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("reading the round/stage counter failed: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("reading the rewards failed: {0}")]
    Storage(#[from] StorageError),
}

/// The round/stage counter as served to dashboards. Both are `-1` until the counter was read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAndStage {
    pub round: i64,
    pub stage: i64,
}

impl From<Option<RoundStage>> for RoundAndStage {
    fn from(round_stage: Option<RoundStage>) -> Self {
        match round_stage {
            Some(RoundStage { round, stage }) => Self {
                round: round as i64,
                stage: stage as i64,
            },
            None => Self {
                round: -1,
                stage: -1,
            },
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    round_stage: Option<RoundStage>,
    leaderboard: Leaderboard,
    cumulative: CumulativeLeaderboard,
    rewards_history: BTreeMap<PeerId, Vec<ScorePoint>>,
    gossip: GossipFeed,
    last_polled: Option<f64>,
}

/// The derived views of the swarm, shared between the poller and the request handlers.
#[derive(Clone, Debug)]
pub struct SwarmCache {
    state: Arc<Mutex<CacheState>>,
    names: Arc<NameCache>,
    clock: Arc<dyn Clock>,
    stale_after: f64,
}

impl SwarmCache {
    /// Creates an empty cache that turns unhealthy when its last poll is older than
    /// `stale_after`.
    pub fn new(clock: Arc<dyn Clock>, stale_after: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            names: Arc::new(NameCache::default()),
            clock,
            stale_after: stale_after.as_secs_f64(),
        }
    }

    /// The memo of peer nicknames.
    pub fn names(&self) -> &NameCache {
        &self.names
    }

    pub async fn round_and_stage(&self) -> RoundAndStage {
        self.state.lock().await.round_stage.into()
    }

    pub async fn leaderboard(&self) -> Leaderboard {
        self.state.lock().await.leaderboard.clone()
    }

    pub async fn cumulative_leaderboard(&self) -> CumulativeLeaderboard {
        self.state.lock().await.cumulative.clone()
    }

    pub async fn gossip(&self) -> GossipFeed {
        self.state.lock().await.gossip.clone()
    }

    /// The store time of the last completed poll.
    pub async fn last_polled(&self) -> Option<f64> {
        self.state.lock().await.last_polled
    }

    /// The seconds since the last completed poll.
    pub async fn poll_age(&self) -> Option<f64> {
        let last_polled = self.last_polled().await?;
        Some(self.clock.now() - last_polled)
    }

    pub fn stale_after(&self) -> f64 {
        self.stale_after
    }

    /// Checks whether a poll completed within the staleness window.
    pub async fn is_healthy(&self) -> bool {
        matches!(self.poll_age().await, Some(age) if age <= self.stale_after)
    }

    /// The ids of all peers on either leaderboard.
    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let state = self.state.lock().await;
        let mut ids: Vec<PeerId> = state
            .leaderboard
            .leaders
            .iter()
            .map(|entry| entry.id.clone())
            .chain(state.cumulative.leaders.iter().map(|entry| entry.id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Refreshes a [`SwarmCache`] from the shared store.
pub struct CachePoller<S> {
    cache: SwarmCache,
    store: SwarmStore<S>,
    coordinator: Arc<dyn SwarmCoordinator>,
    settings: CacheSettings,
    sampler: GossipSampler,
    rng: StdRng,
}

impl<S> CachePoller<S>
where
    S: SwarmStorage,
{
    /// Creates a poller of `cache`. The round/stage counter is read through `coordinator`.
    pub fn new(
        cache: SwarmCache,
        store: SwarmStore<S>,
        coordinator: Arc<dyn SwarmCoordinator>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            cache,
            store,
            coordinator,
            sampler: GossipSampler::new(&settings),
            settings,
            rng: StdRng::from_entropy(),
        }
    }

    /// Polls forever, every `poll_interval` seconds.
    pub async fn run(mut self) {
        let interval = Duration::from_secs(self.settings.poll_interval);
        loop {
            let span = error_span!("cache_poll");
            if let Err(err) = self.poll().instrument(span).await {
                error!("cache failed to poll the store: {}", err);
            }
            sleep(interval).await;
        }
    }

    /// Refreshes every view once.
    ///
    /// Without a readable counter only the poll time is refreshed. Without rewards for the current
    /// `(round, stage)` the snapshot leaderboard and the gossip are emptied and the cumulative
    /// leaderboard is kept.
    ///
    /// # Errors
    /// Fails if the counter or the rewards cannot be read. The cache is left untouched then.
    pub async fn poll(&mut self) -> Result<(), CacheError> {
        let round_stage = match self.coordinator.get_round_and_stage().await {
            Ok(round_stage) => Some(round_stage),
            Err(CoordinatorError::NoRoundAndStage) => None,
            Err(err) => return Err(err.into()),
        };
        let now = self.store.now();

        let (record, gossip) = match round_stage {
            Some(round_stage) => {
                info!("cache polled round and stage {}", round_stage);
                match self.store.rewards(round_stage).await? {
                    Some(record) => {
                        let peers: Vec<PeerId> = record.keys().cloned().collect();
                        let gossip = self
                            .sampler
                            .sample(
                                &mut self.store,
                                round_stage,
                                &peers,
                                self.cache.names(),
                                &mut self.rng,
                            )
                            .await;
                        (Some(record), gossip)
                    }
                    None => {
                        debug!("no rewards for {}", round_stage);
                        (None, GossipFeed::default())
                    }
                }
            }
            None => {
                debug!("the round and stage are not published yet");
                (None, GossipFeed::default())
            }
        };

        let mut state = self.cache.state.lock().await;
        let state = &mut *state;
        if let Some(round_stage) = round_stage {
            state.round_stage = Some(round_stage);
            let timestamp = now as i64;
            match &record {
                Some(record) => {
                    state.leaderboard = simple_leaderboard(
                        record,
                        &mut state.rewards_history,
                        timestamp,
                        self.settings.rewards_history_len,
                        &self.cache.names,
                    );
                    update_cumulative(
                        &mut state.cumulative,
                        record,
                        round_stage,
                        timestamp,
                        self.settings.history_len,
                        &self.cache.names,
                    );
                }
                None => state.leaderboard = Leaderboard::default(),
            }
            state.gossip = gossip;
        }
        state.last_polled = Some(now);
        Ok(())
    }
}
