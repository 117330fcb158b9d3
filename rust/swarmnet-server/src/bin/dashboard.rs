use std::{path::PathBuf, process, sync::Arc, time::Duration};

use structopt::StructOpt;
use tokio::signal;
use tracing::{error, warn};
use tracing_subscriber::FmtSubscriber;

use swarmnet_server::{
    cache::{CachePoller, SwarmCache},
    coordinator,
    rest,
    settings::{
        ApiSettings,
        CacheSettings,
        CoordinatorSettings,
        DashboardSettings,
        StoreBackend,
        StoreSettings,
    },
    storage::{redis, MemoryStore, ReadOptions, SwarmStorage, SwarmStore},
    utils::{Clock, SystemClock},
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Dashboard")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = DashboardSettings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let DashboardSettings {
        store: store_settings,
        redis: redis_settings,
        coordinator: coordinator_settings,
        cache: cache_settings,
        api: api_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dashboard = Dashboard {
        store_settings,
        coordinator_settings,
        cache_settings,
        api_settings,
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
            dashboard.run(client).await
        }
        (StoreBackend::Redis, None) => {
            error!("missing redis settings");
            process::exit(1);
        }
        (StoreBackend::Memory, _) => {
            warn!("the store is private to this process, the dashboard will stay empty");
            dashboard.run(MemoryStore::new(clock)).await
        }
    }
}

struct Dashboard {
    store_settings: StoreSettings,
    coordinator_settings: CoordinatorSettings,
    cache_settings: CacheSettings,
    api_settings: ApiSettings,
    clock: Arc<dyn Clock>,
}

impl Dashboard {
    async fn run<S: SwarmStorage>(self, storage: S) {
        let store = SwarmStore::new(storage, self.clock.clone()).with_read_options(ReadOptions {
            beam_size: self.store_settings.beam_size,
            ..ReadOptions::default()
        });
        let coordinator = coordinator::from_settings(&self.coordinator_settings, &store)
            .unwrap_or_else(|err| {
                error!("failed to create the coordinator client: {}", err);
                process::exit(1);
            });

        let cache = SwarmCache::new(
            self.clock,
            Duration::from_secs(self.cache_settings.stale_after),
        );
        let poller = CachePoller::new(cache.clone(), store, coordinator, self.cache_settings);

        tokio::select! {
            _ = poller.run() => {
                warn!("shutting down: cache poller terminated");
            }
            _ = rest::serve(self.api_settings, cache) => {
                warn!("shutting down: REST server terminated");
            }
            _ = signal::ctrl_c() => {}
        }
    }
}
