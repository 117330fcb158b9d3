use std::collections::BTreeMap;

use derive_more::Display;

use swarmnet_core::{OutputRecord, PeerId, QuestionHash, RoundStage, TimedOutput};

use crate::{rewards::RewardAccumulator, state_machine::Role};

/// The position of a peer in the training schedule.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum PeerState {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Round {}", _0)]
    Round(u64),
    #[display(fmt = "Stage {}", _0)]
    Stage(RoundStage),
    #[display(fmt = "Done")]
    Done,
}

/// The state of the local peer.
///
/// Only the orchestrator mutates it. The local output cache is authoritative for the peer's own
/// outputs and is cleared at the end of every round.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    role: Role,
    state: PeerState,
    round_stage: RoundStage,
    cache: BTreeMap<RoundStage, OutputRecord>,
    rewards: RewardAccumulator,
}

impl Peer {
    /// Creates a peer that publishes its rewards every `publish_cadence` progress increments.
    pub fn new(id: impl Into<PeerId>, role: Role, publish_cadence: u64) -> Self {
        Self {
            id: id.into(),
            role,
            state: PeerState::Idle,
            round_stage: RoundStage::default(),
            cache: BTreeMap::new(),
            rewards: RewardAccumulator::new(publish_cadence),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// The current round/stage, or the last one before the peer became idle.
    pub fn round_stage(&self) -> RoundStage {
        self.round_stage
    }

    pub fn start_round(&mut self, round: u64) {
        self.state = PeerState::Round(round);
    }

    /// Moves to `round_stage` and starts over with its reward.
    pub fn enter_stage(&mut self, round_stage: RoundStage) {
        self.state = PeerState::Stage(round_stage);
        self.round_stage = round_stage;
        self.rewards.reset();
    }

    pub fn finish(&mut self) {
        self.state = PeerState::Done;
    }

    pub fn rewards(&self) -> &RewardAccumulator {
        &self.rewards
    }

    pub fn rewards_mut(&mut self) -> &mut RewardAccumulator {
        &mut self.rewards
    }

    /// The locally cached outputs of `round_stage`.
    pub fn stage_outputs(&self, round_stage: RoundStage) -> Option<&OutputRecord> {
        self.cache.get(&round_stage)
    }

    pub fn put_stage_output(
        &mut self,
        round_stage: RoundStage,
        question: QuestionHash,
        output: TimedOutput,
    ) {
        self.cache
            .entry(round_stage)
            .or_default()
            .insert(question, output);
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}
