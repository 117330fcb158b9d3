//! Names of the shared records.

use swarmnet_core::RoundStage;

/// The key of the round/stage counter.
pub const ROUND_STAGE_NUMBER_KEY: &str = "rl_swarm_rs";

/// The key of the sorted leaderboard of a `(round, stage)`.
pub fn leaderboard_key(round_stage: RoundStage) -> String {
    format!(
        "rl_swarm_leaderboard_{}_{}",
        round_stage.round, round_stage.stage
    )
}

/// The key of the reward record of a `(round, stage)`.
pub fn rewards_key(round_stage: RoundStage) -> String {
    format!(
        "rl_swarm_rewards_{}_{}",
        round_stage.round, round_stage.stage
    )
}

/// The key of a peer's output record for a `(round, stage)`.
pub fn outputs_key(peer_id: &str, round_stage: RoundStage) -> String {
    format!(
        "rl_swarm_outputs_{}_{}_{}",
        peer_id, round_stage.round, round_stage.stage
    )
}
