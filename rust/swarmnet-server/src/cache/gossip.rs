//! Sampling of recent peer outputs into human readable gossip.

use std::{cmp::max, collections::BTreeMap, time::Duration};

use rand::{seq::SliceRandom, Rng};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use swarmnet_core::{
    gossip::{GossipFeed, GossipMessage},
    hash::gossip_id,
    names::NameCache,
    PeerId,
    RoundStage,
    StageOutput,
    NUM_STAGES,
};

use crate::{
    rewards::extract_tag,
    settings::CacheSettings,
    storage::{SwarmStorage, SwarmStore},
};

/// Renders an output of `peer_id` published for `stage`.
///
/// Stages 1 and 2 quote the tagged sections of the peer's own contribution. If those are missing
/// the output is rendered like a stage 0 output.
pub fn format_message(stage: u64, peer_id: &str, output: &StageOutput) -> String {
    let tagged = |first: &str, second: &str| {
        let contribution = output.contribution(peer_id)?;
        Some((
            extract_tag(contribution, first)?,
            extract_tag(contribution, second)?,
        ))
    };
    match stage {
        0 => answer_message(output),
        1 => match tagged("explain", "identify") {
            Some((explain, identify)) => format!("{}...Identify: {}", explain, identify),
            None => answer_message(output),
        },
        2 => match tagged("summarize_feedback", "majority") {
            Some((summary, majority)) => format!("{}...Majority: {}", summary, majority),
            None => answer_message(output),
        },
        _ => format!("Cannot render output for unknown stage {}", stage),
    }
}

fn answer_message(output: &StageOutput) -> String {
    format!("{}...Answer: {}", output.question(), output.answer())
}

/// Collects a bounded sample of recent outputs.
#[derive(Clone, Copy, Debug)]
pub struct GossipSampler {
    node_target: usize,
    message_target: usize,
    rounds: u64,
    budget: Duration,
}

impl GossipSampler {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            node_target: settings.node_target,
            message_target: settings.message_target,
            rounds: settings.gossip_rounds,
            budget: Duration::from_secs(settings.gossip_timeout),
        }
    }

    /// Samples up to `node_target` of `peers` and renders their outputs of the last rounds up to
    /// `round_stage`, newest first.
    ///
    /// The feed holds at most `message_target` messages, spread evenly over the sampled peers.
    /// Whatever was collected when the time budget runs out is kept.
    pub async fn sample<S, R>(
        &self,
        store: &mut SwarmStore<S>,
        round_stage: RoundStage,
        peers: &[PeerId],
        names: &NameCache,
        rng: &mut R,
    ) -> GossipFeed
    where
        S: SwarmStorage,
        R: Rng,
    {
        let sampled: Vec<PeerId> = peers
            .choose_multiple(rng, self.node_target.min(peers.len()))
            .cloned()
            .collect();
        if sampled.is_empty() {
            return GossipFeed::default();
        }
        let per_peer = max(1, self.message_target / sampled.len());

        let mut messages = Vec::new();
        let collect = self.collect(store, round_stage, &sampled, per_peer, names, &mut messages);
        if timeout(self.budget, collect).await.is_err() {
            warn!("gossip collection timed out after {:?}", self.budget);
        }
        info!(
            "collected {} gossip messages from {} peers",
            messages.len(),
            sampled.len()
        );

        messages.sort_by(|a, b| {
            b.timestamp
                .total_cmp(&a.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });
        GossipFeed { messages }
    }

    async fn collect<S>(
        &self,
        store: &mut SwarmStore<S>,
        round_stage: RoundStage,
        sampled: &[PeerId],
        per_peer: usize,
        names: &NameCache,
        messages: &mut Vec<GossipMessage>,
    ) where
        S: SwarmStorage,
    {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        let first_round = round_stage.round.saturating_sub(self.rounds);
        for round in (first_round..=round_stage.round).rev() {
            for stage in (0..NUM_STAGES).rev() {
                let rs = RoundStage::new(round, stage);
                if rs > round_stage {
                    continue;
                }
                for peer_id in sampled {
                    if messages.len() >= self.message_target {
                        return;
                    }
                    let sent = counts.get(peer_id.as_str()).copied().unwrap_or_default();
                    if sent >= per_peer {
                        continue;
                    }
                    let record = match store.outputs(peer_id, rs).await {
                        Ok(Some(record)) => record,
                        Ok(None) => continue,
                        Err(err) => {
                            debug!("skipping the outputs of {} for {}: {}", peer_id, rs, err);
                            continue;
                        }
                    };

                    let mut outputs: Vec<_> = record.into_values().collect();
                    outputs.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
                    let count = counts.entry(peer_id.as_str()).or_default();
                    for output in outputs {
                        if *count >= per_peer || messages.len() >= self.message_target {
                            break;
                        }
                        messages.push(GossipMessage {
                            id: gossip_id(peer_id, rs, output.output.question()),
                            message: format_message(stage, peer_id, &output.output),
                            node: names.get(peer_id),
                            node_id: peer_id.clone(),
                            timestamp: output.timestamp,
                        });
                        *count += 1;
                    }
                }
            }
        }
    }
}
