//! Clients of the external coordination service.
//!
//! The service knows the bootstrap addresses of the swarm, registers peers, records the winners
//! of every round and exposes the round/stage counter. Registering a peer twice or submitting the
//! winners of a round twice is answered with an error by the service, which the clients treat as
//! success.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use swarmnet_core::{PeerId, RoundStage};

use crate::{
    settings::{CoordinatorKind, CoordinatorSettings},
    storage::{StorageError, SwarmStorage, SwarmStore},
};

/// Error returned by a [`SwarmCoordinator`].
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("the coordinator rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("reading the round/stage counter failed: {0}")]
    Storage(#[from] StorageError),

    #[error("the round/stage counter is not published")]
    NoRoundAndStage,

    #[error("the proxy coordinator needs a url and an org_id")]
    Misconfigured,
}

/// The external coordination service of a swarm.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwarmCoordinator: Send + Sync {
    /// The network addresses peers join the swarm through.
    async fn get_bootnodes(&self) -> Result<Vec<String>, CoordinatorError>;

    /// Registers a peer. Registering a peer again succeeds.
    async fn register_peer(&self, peer_id: &str) -> Result<(), CoordinatorError>;

    /// Submits the winners of a round. Submitting them again succeeds.
    async fn submit_winners(&self, round: u64, winners: &[PeerId])
        -> Result<(), CoordinatorError>;

    /// The current round/stage counter as seen by the service.
    async fn get_round_and_stage(&self) -> Result<RoundStage, CoordinatorError>;
}

/// Error messages of the service that report an already performed operation.
const IDEMPOTENT_REJECTIONS: [&str; 2] = ["already registered", "already submitted"];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPeer<'a> {
    org_id: &'a str,
    peer_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitWinners<'a> {
    org_id: &'a str,
    round_number: u64,
    winners: &'a [PeerId],
}

#[derive(Deserialize)]
struct RoundAndStage {
    round: u64,
    stage: u64,
}

#[derive(Debug)]
/// A client of the HTTP proxy in front of the coordination service.
pub struct ProxyCoordinator {
    client: Client,
    address: String,
    org_id: String,
}

impl ProxyCoordinator {
    /// Creates a client of the proxy at `address`, acting for the organization `org_id`.
    pub fn new(
        address: impl Into<String>,
        org_id: impl Into<String>,
    ) -> Result<Self, CoordinatorError> {
        let client = ClientBuilder::new().use_rustls_tls().build()?;
        let address: String = address.into();
        Ok(Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            org_id: org_id.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.address, path)
    }

    /// Maps a failed response to an error, unless it reports an already performed operation.
    async fn accept(resp: Response) -> Result<(), CoordinatorError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let message = resp.text().await?;
        let lowercase = message.to_lowercase();
        if IDEMPOTENT_REJECTIONS
            .iter()
            .any(|rejection| lowercase.contains(rejection))
        {
            debug!("ignoring rejection of a repeated request: {}", message);
            Ok(())
        } else {
            Err(CoordinatorError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl SwarmCoordinator for ProxyCoordinator {
    async fn get_bootnodes(&self) -> Result<Vec<String>, CoordinatorError> {
        let resp = self
            .client
            .get(&self.url("bootnodes"))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn register_peer(&self, peer_id: &str) -> Result<(), CoordinatorError> {
        let body = RegisterPeer {
            org_id: &self.org_id,
            peer_id,
        };
        let resp = self
            .client
            .post(&self.url("register-peer"))
            .json(&body)
            .send()
            .await?;
        Self::accept(resp).await
    }

    async fn submit_winners(
        &self,
        round: u64,
        winners: &[PeerId],
    ) -> Result<(), CoordinatorError> {
        let body = SubmitWinners {
            org_id: &self.org_id,
            round_number: round,
            winners,
        };
        let resp = self
            .client
            .post(&self.url("submit-winner"))
            .json(&body)
            .send()
            .await?;
        Self::accept(resp).await
    }

    async fn get_round_and_stage(&self) -> Result<RoundStage, CoordinatorError> {
        let resp = self
            .client
            .get(&self.url("round-and-stage"))
            .send()
            .await?
            .error_for_status()?;
        let RoundAndStage { round, stage } = resp.json().await?;
        Ok(RoundStage::new(round, stage))
    }
}

/// A coordination service inside the process, for swarms sharing one store without an external
/// service.
///
/// The round/stage counter is read from the shared store.
pub struct LocalCoordinator<S> {
    store: Mutex<SwarmStore<S>>,
    bootnodes: Vec<String>,
    registered: Mutex<BTreeSet<PeerId>>,
    winners: Mutex<BTreeMap<u64, Vec<PeerId>>>,
}

impl<S> LocalCoordinator<S>
where
    S: SwarmStorage,
{
    pub fn new(store: SwarmStore<S>) -> Self {
        Self {
            store: Mutex::new(store),
            bootnodes: Vec::new(),
            registered: Mutex::new(BTreeSet::new()),
            winners: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_bootnodes(mut self, bootnodes: Vec<String>) -> Self {
        self.bootnodes = bootnodes;
        self
    }

    /// The registered peers.
    pub async fn registered(&self) -> BTreeSet<PeerId> {
        self.registered.lock().await.clone()
    }

    /// The winners submitted for a round.
    pub async fn winners(&self, round: u64) -> Option<Vec<PeerId>> {
        self.winners.lock().await.get(&round).cloned()
    }
}

#[async_trait]
impl<S> SwarmCoordinator for LocalCoordinator<S>
where
    S: SwarmStorage,
{
    async fn get_bootnodes(&self) -> Result<Vec<String>, CoordinatorError> {
        Ok(self.bootnodes.clone())
    }

    async fn register_peer(&self, peer_id: &str) -> Result<(), CoordinatorError> {
        if self.registered.lock().await.insert(peer_id.to_string()) {
            info!("registered peer {}", peer_id);
        }
        Ok(())
    }

    async fn submit_winners(
        &self,
        round: u64,
        winners: &[PeerId],
    ) -> Result<(), CoordinatorError> {
        let mut submitted = self.winners.lock().await;
        if !submitted.contains_key(&round) {
            info!("winners of round {}: {:?}", round, winners);
            submitted.insert(round, winners.to_vec());
        }
        Ok(())
    }

    async fn get_round_and_stage(&self) -> Result<RoundStage, CoordinatorError> {
        self.store
            .lock()
            .await
            .round_and_stage()
            .await?
            .ok_or(CoordinatorError::NoRoundAndStage)
    }
}

/// Creates the coordinator described by `settings`. Without an external service the
/// coordinator lives in the process and reads the counter from `store`.
pub fn from_settings<S>(
    settings: &CoordinatorSettings,
    store: &SwarmStore<S>,
) -> Result<Arc<dyn SwarmCoordinator>, CoordinatorError>
where
    S: SwarmStorage,
{
    match (settings.kind, &settings.url, &settings.org_id) {
        (CoordinatorKind::None, _, _) => Ok(Arc::new(LocalCoordinator::new(store.clone()))),
        (CoordinatorKind::Proxy, Some(url), Some(org_id)) => {
            Ok(Arc::new(ProxyCoordinator::new(url.as_str(), org_id.as_str())?))
        }
        (CoordinatorKind::Proxy, _, _) => Err(CoordinatorError::Misconfigured),
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use serde_json::{json, Value};
    use warp::{http::StatusCode, Filter};

    use super::*;
    use crate::{
        storage::MemoryStore,
        utils::{Clock, ManualClock},
    };

    /// Serves a fake proxy that rejects every peer registration after the first.
    async fn serve_proxy() -> SocketAddr {
        let registered = Arc::new(std::sync::Mutex::new(BTreeSet::<String>::new()));
        let register = warp::path!("api" / "register-peer")
            .and(warp::post())
            .and(warp::body::json())
            .map(move |body: Value| {
                let peer_id = body["peerId"].as_str().unwrap_or_default().to_string();
                assert_eq!(body["orgId"], "org");
                let fresh = registered.lock().unwrap().insert(peer_id);
                if fresh {
                    warp::reply::with_status("{}".to_string(), StatusCode::OK)
                } else {
                    warp::reply::with_status(
                        r#"{"error":"Peer already registered"}"#.to_string(),
                        StatusCode::BAD_REQUEST,
                    )
                }
            });
        let submit = warp::path!("api" / "submit-winner")
            .and(warp::post())
            .and(warp::body::json())
            .map(|body: Value| {
                if body["roundNumber"] == 0 {
                    warp::reply::with_status("{}".to_string(), StatusCode::OK)
                } else {
                    warp::reply::with_status(
                        r#"{"error":"internal failure"}"#.to_string(),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    )
                }
            });
        let round_and_stage = warp::path!("api" / "round-and-stage")
            .map(|| warp::reply::json(&json!({"round": 4, "stage": 2})));
        let bootnodes = warp::path!("api" / "bootnodes")
            .map(|| warp::reply::json(&json!(["/ip4/127.0.0.1/tcp/38331"])));

        let (addr, server) = warp::serve(register.or(submit).or(round_and_stage).or(bootnodes))
            .bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn test_proxy_coordinator() {
        let addr = serve_proxy().await;
        let proxy = ProxyCoordinator::new(format!("http://{}/", addr), "org").unwrap();

        proxy.register_peer("peer").await.unwrap();
        // the second registration is rejected by the service
        proxy.register_peer("peer").await.unwrap();

        proxy
            .submit_winners(0, &["peer".to_string()])
            .await
            .unwrap();
        assert!(matches!(
            proxy.submit_winners(1, &[]).await,
            Err(CoordinatorError::Rejected { status: 500, .. })
        ));

        assert_eq!(
            proxy.get_round_and_stage().await.unwrap(),
            RoundStage::new(4, 2)
        );
        assert_eq!(
            proxy.get_bootnodes().await.unwrap(),
            vec!["/ip4/127.0.0.1/tcp/38331".to_string()]
        );
    }

    #[tokio::test]
    async fn test_local_coordinator() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0.));
        let mut store = SwarmStore::new(MemoryStore::new(clock.clone()), clock);
        let coordinator = LocalCoordinator::new(store.clone());

        assert!(matches!(
            coordinator.get_round_and_stage().await,
            Err(CoordinatorError::NoRoundAndStage)
        ));
        store
            .publish_round_and_stage(RoundStage::new(1, 2))
            .await
            .unwrap();
        assert_eq!(
            coordinator.get_round_and_stage().await.unwrap(),
            RoundStage::new(1, 2)
        );

        coordinator.register_peer("a").await.unwrap();
        coordinator.register_peer("a").await.unwrap();
        assert_eq!(coordinator.registered().await.len(), 1);

        coordinator
            .submit_winners(1, &["a".to_string()])
            .await
            .unwrap();
        coordinator
            .submit_winners(1, &["b".to_string()])
            .await
            .unwrap();
        assert_eq!(coordinator.winners(1).await, Some(vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn test_from_settings() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0.));
        let mut store = SwarmStore::new(MemoryStore::new(clock.clone()), clock);
        store
            .publish_round_and_stage(RoundStage::new(0, 1))
            .await
            .unwrap();

        let local = from_settings(&CoordinatorSettings::default(), &store).unwrap();
        assert_eq!(
            local.get_round_and_stage().await.unwrap(),
            RoundStage::new(0, 1)
        );

        let settings = CoordinatorSettings {
            kind: CoordinatorKind::Proxy,
            url: Some("http://localhost:3000".into()),
            org_id: None,
        };
        assert!(matches!(
            from_settings(&settings, &store),
            Err(CoordinatorError::Misconfigured)
        ));
    }
}
