use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use swarmnet_core::RoundStage;

use crate::{
    coordinator::{LocalCoordinator, SwarmCoordinator},
    merge::StageSample,
    rewards::{FormatScorer, RewardScorer},
    settings::{CounterSource, MergeSettings, PollingSettings, TrainingSettings},
    state_machine::{
        default_dataset,
        DryRunTrainer,
        Orchestrator,
        OrchestratorSettings,
        Peer,
        ProgressSink,
        Role,
        StageInput,
        TrainingError,
        TrainingStep,
    },
    storage::{MemoryStore, SwarmStore},
    utils::{Clock, ManualClock},
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

pub fn store() -> SwarmStore<MemoryStore> {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000_000.));
    SwarmStore::new(MemoryStore::new(clock.clone()), clock)
}

pub fn settings(max_rounds: u64) -> OrchestratorSettings {
    OrchestratorSettings {
        training: TrainingSettings {
            max_rounds,
            train_timeout: 24 * 3600,
            publish_cadence: 2,
            max_train_fails: 3,
            train_retry_pause: 5,
            output_expiration: 4 * 3600,
            winners: 3,
            follow: CounterSource::Store,
            dataset: None,
        },
        polling: PollingSettings::default(),
        merge: MergeSettings::default(),
    }
}

pub fn local_coordinator(store: &SwarmStore<MemoryStore>) -> Arc<LocalCoordinator<MemoryStore>> {
    Arc::new(LocalCoordinator::new(store.clone()))
}

/// A [`DryRunTrainer`] that records its inputs and can be told to fail or to take its time.
pub struct RecordingTrainer {
    inner: DryRunTrainer,
    seen: Arc<Mutex<Vec<RoundStage>>>,
    cleanups: Arc<AtomicUsize>,
    failures: u32,
    delay: Option<Duration>,
}

impl RecordingTrainer {
    pub fn new(peer_id: &str) -> Self {
        let scorer: Arc<dyn RewardScorer> = Arc::new(FormatScorer);
        Self {
            inner: DryRunTrainer::new(peer_id, scorer),
            seen: Arc::new(Mutex::new(Vec::new())),
            cleanups: Arc::new(AtomicUsize::new(0)),
            failures: 0,
            delay: None,
        }
    }

    /// Fails the next `failures` attempts with a transport error.
    pub fn failing(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    /// Sleeps for `delay` before every attempt.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// A handle on the round/stage of every attempt so far.
    pub fn seen(&self) -> Arc<Mutex<Vec<RoundStage>>> {
        self.seen.clone()
    }

    pub fn cleanups(&self) -> Arc<AtomicUsize> {
        self.cleanups.clone()
    }
}

#[async_trait]
impl TrainingStep for RecordingTrainer {
    async fn train(
        &mut self,
        input: &StageInput,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TrainingError> {
        self.seen.lock().unwrap().push(input.round_stage);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures > 0 {
            self.failures -= 1;
            return Err(TrainingError::Transport("connection reset".into()));
        }
        self.inner.train(input, sink).await
    }

    fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn orchestrator(
    peer_id: &str,
    role: Role,
    store: &SwarmStore<MemoryStore>,
    trainer: RecordingTrainer,
    coordinator: Arc<dyn SwarmCoordinator>,
    settings: OrchestratorSettings,
) -> Orchestrator<MemoryStore, RecordingTrainer> {
    orchestrator_with_dataset(
        peer_id,
        role,
        store,
        trainer,
        coordinator,
        settings,
        default_dataset(),
    )
}

pub fn orchestrator_with_dataset(
    peer_id: &str,
    role: Role,
    store: &SwarmStore<MemoryStore>,
    trainer: RecordingTrainer,
    coordinator: Arc<dyn SwarmCoordinator>,
    settings: OrchestratorSettings,
    dataset: Vec<StageSample>,
) -> Orchestrator<MemoryStore, RecordingTrainer> {
    let peer = Peer::new(peer_id, role, settings.training.publish_cadence);
    Orchestrator::new(
        peer,
        store.clone(),
        trainer,
        coordinator,
        Arc::new(FormatScorer),
        settings,
        dataset,
    )
}

pub fn stages(round: u64, stages: &[u64]) -> Vec<RoundStage> {
    stages
        .iter()
        .map(|stage| RoundStage::new(round, *stage))
        .collect()
}
