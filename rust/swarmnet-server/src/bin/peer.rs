use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

use swarmnet_server::{
    coordinator,
    rewards::{FormatScorer, RewardScorer},
    settings::{
        CoordinatorSettings,
        MergeSettings,
        PeerSettings,
        PollingSettings,
        Settings,
        StoreBackend,
        StoreSettings,
        TrainingSettings,
    },
    state_machine::{
        default_dataset,
        load_dataset,
        DryRunTrainer,
        Orchestrator,
        OrchestratorSettings,
        Peer,
    },
    storage::{redis, MemoryStore, ReadOptions, SwarmStorage, SwarmStore},
    utils::{Clock, SystemClock},
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Peer")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        peer: peer_settings,
        training: training_settings,
        polling: polling_settings,
        merge: merge_settings,
        store: store_settings,
        redis: redis_settings,
        coordinator: coordinator_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let peer = PeerProcess {
        peer_settings,
        training_settings,
        polling_settings,
        merge_settings,
        store_settings,
        clock: clock.clone(),
    };

    match (store_settings.backend, redis_settings) {
        (StoreBackend::Redis, Some(redis_settings)) => {
            let client =
                redis::Client::new(redis_settings.url, redis_settings.connections, clock)
                    .await
                    .unwrap_or_else(|err| {
                        error!("failed to connect to redis: {}", err);
                        process::exit(1);
                    });
            peer.run(client, coordinator_settings).await
        }
        (StoreBackend::Redis, None) => {
            error!("missing redis settings");
            process::exit(1);
        }
        (StoreBackend::Memory, _) => {
            warn!("the store is private to this process");
            peer.run(MemoryStore::new(clock), coordinator_settings).await
        }
    }
}

struct PeerProcess {
    peer_settings: PeerSettings,
    training_settings: TrainingSettings,
    polling_settings: PollingSettings,
    merge_settings: MergeSettings,
    store_settings: StoreSettings,
    clock: Arc<dyn Clock>,
}

impl PeerProcess {
    async fn run<S: SwarmStorage>(
        self,
        storage: S,
        coordinator_settings: CoordinatorSettings,
    ) {
        let store = SwarmStore::new(storage, self.clock)
            .with_expiration(self.training_settings.output_expiration as f64)
            .with_read_options(ReadOptions {
                beam_size: self.store_settings.beam_size,
                ..ReadOptions::default()
            });
        let coordinator =
            coordinator::from_settings(&coordinator_settings, &store).unwrap_or_else(|err| {
                error!("failed to create the coordinator client: {}", err);
                process::exit(1);
            });

        let dataset = match &self.training_settings.dataset {
            Some(path) => load_dataset(path).unwrap_or_else(|err| {
                error!("failed to load the dataset {}: {}", path, err);
                process::exit(1);
            }),
            None => {
                info!("no dataset configured, training on the built-in questions");
                default_dataset()
            }
        };

        let scorer: Arc<dyn RewardScorer> = Arc::new(FormatScorer);
        let trainer = DryRunTrainer::new(self.peer_settings.id.clone(), scorer.clone());
        let peer = Peer::new(
            self.peer_settings.id,
            self.peer_settings.role,
            self.training_settings.publish_cadence,
        );
        let mut orchestrator = Orchestrator::new(
            peer,
            store,
            trainer,
            coordinator,
            scorer,
            OrchestratorSettings {
                training: self.training_settings,
                polling: self.polling_settings,
                merge: self.merge_settings,
            },
            dataset,
        );

        tokio::select! {
            result = orchestrator.run() => {
                if let Err(err) = result {
                    error!("shutting down: training failed: {}", err);
                    process::exit(1);
                }
                info!("shutting down: training finished");
            }
            _ = signal::ctrl_c() => {
                warn!("shutting down: interrupted");
            }
        }
    }
}
