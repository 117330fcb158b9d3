//! A HTTP API for the dashboard.
//!
//! Every route answers from the [`SwarmCache`], never from the store.

use std::{collections::BTreeMap, convert::Infallible};

use displaydoc::Display;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};
use warp::{http::StatusCode, reply::Reply, Filter, Rejection};

use swarmnet_core::{names::search_peer_ids_for_name, PeerId};

use crate::{cache::SwarmCache, settings::ApiSettings};

/// The maximal number of ids of a name lookup.
pub const MAX_LOOKUP_IDS: usize = 1000;
/// The maximal body size of a name lookup, in bytes.
pub const MAX_LOOKUP_BYTES: u64 = 100 * 1024;

#[derive(Deserialize)]
struct NameQuery {
    #[serde(default)]
    name: String,
}

/// Starts a HTTP server at the configured address, answering GET requests from `cache`.
pub async fn serve(api_settings: ApiSettings, cache: SwarmCache) {
    warp::serve(routes(cache)).run(api_settings.bind_address).await;
}

/// The routes of the API.
pub fn routes(
    cache: SwarmCache,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health = warp::path!("api" / "healthz")
        .and(warp::get())
        .and(with_cache(cache.clone()))
        .and_then(handle_health);

    let round_and_stage = warp::path!("api" / "round_and_stage")
        .and(warp::get())
        .and(with_cache(cache.clone()))
        .and_then(handle_round_and_stage);

    let leaderboard = warp::path!("api" / "leaderboard")
        .and(warp::get())
        .and(with_cache(cache.clone()))
        .and_then(handle_leaderboard);

    let cumulative = warp::path!("api" / "leaderboard-cumulative")
        .and(warp::get())
        .and(with_cache(cache.clone()))
        .and_then(handle_cumulative_leaderboard);

    let gossip = warp::path!("api" / "gossip")
        .and(warp::get())
        .and(with_cache(cache.clone()))
        .and_then(handle_gossip);

    let name_to_id = warp::path!("api" / "name-to-id")
        .and(warp::get())
        .and(warp::query::<NameQuery>())
        .and(with_cache(cache.clone()))
        .and_then(handle_name_to_id);

    let id_to_name = warp::path!("api" / "id-to-name")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_LOOKUP_BYTES))
        .and(warp::body::json())
        .and_then(check_lookup)
        .and(with_cache(cache))
        .and_then(handle_id_to_name);

    health
        .or(round_and_stage)
        .or(leaderboard)
        .or(cumulative)
        .or(gossip)
        .or(name_to_id)
        .or(id_to_name)
        .recover(handle_reject)
        .with(warp::log("http"))
}

/// Handles and responds to a health check.
async fn handle_health(cache: SwarmCache) -> Result<impl warp::Reply, Infallible> {
    let (body, code) = match cache.poll_age().await {
        None => (
            json!({ "detail": "the store was never polled" }),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
        Some(age) if age > cache.stale_after() => (
            json!({
                "detail": format!("the last poll is older than {} seconds", cache.stale_after())
            }),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
        Some(age) => (
            json!({ "message": "OK", "lastPolled": age }),
            StatusCode::OK,
        ),
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), code))
}

async fn handle_round_and_stage(cache: SwarmCache) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&cache.round_and_stage().await))
}

async fn handle_leaderboard(cache: SwarmCache) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&cache.leaderboard().await))
}

async fn handle_cumulative_leaderboard(
    cache: SwarmCache,
) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&cache.cumulative_leaderboard().await))
}

async fn handle_gossip(cache: SwarmCache) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&cache.gossip().await))
}

/// Handles and responds to a lookup of the peer id behind a nickname.
async fn handle_name_to_id(
    query: NameQuery,
    cache: SwarmCache,
) -> Result<impl warp::Reply, Infallible> {
    let peer_ids = cache.peer_ids().await;
    let reply = match search_peer_ids_for_name(peer_ids.iter().map(String::as_str), &query.name) {
        Some(id) => {
            warp::reply::with_status(warp::reply::json(&json!({ "id": id })), StatusCode::OK)
        }
        None => {
            debug!("no peer is named {:?}", query.name);
            warp::reply::with_status(
                warp::reply::json(&json!({ "detail": "unknown name" })),
                StatusCode::NOT_FOUND,
            )
        }
    };
    Ok(reply)
}

/// Handles and responds to a lookup of the nicknames of peer ids.
async fn handle_id_to_name(
    peer_ids: Vec<PeerId>,
    cache: SwarmCache,
) -> Result<impl warp::Reply, Infallible> {
    let names: BTreeMap<PeerId, String> = peer_ids
        .into_iter()
        .map(|peer_id| {
            let name = cache.names().get(&peer_id);
            (peer_id, name)
        })
        .collect();
    Ok(warp::reply::json(&names))
}

/// Rejects name lookups of too many ids.
async fn check_lookup(peer_ids: Vec<PeerId>) -> Result<Vec<PeerId>, Rejection> {
    if peer_ids.len() > MAX_LOOKUP_IDS {
        Err(warp::reject::custom(LookupError::TooManyIds))
    } else {
        Ok(peer_ids)
    }
}

/// Converts a cache into a `warp` filter.
fn with_cache(
    cache: SwarmCache,
) -> impl Filter<Extract = (SwarmCache,), Error = Infallible> + Clone {
    warp::any().map(move || cache.clone())
}

/// Error of a name lookup request.
#[derive(Debug, Display, Error)]
enum LookupError {
    /// too many ids are looked up at once
    TooManyIds,
}

impl warp::reject::Reject for LookupError {}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: Rejection) -> Result<impl warp::Reply, Infallible> {
    let code = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if let Some(LookupError::TooManyIds) = err.find() {
        StatusCode::BAD_REQUEST
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else if err.find::<warp::body::BodyDeserializeError>().is_some()
        || err.find::<warp::reject::InvalidQuery>().is_some()
        || err.find::<warp::reject::LengthRequired>().is_some()
    {
        StatusCode::BAD_REQUEST
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        error!("unhandled rejection: {:?}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    // reply with empty body; the status code is the interesting part
    Ok(warp::reply::with_status(Vec::new(), code))
}
