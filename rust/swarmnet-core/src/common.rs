use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::output::TimedOutput;

/// The number of stages in every round.
pub const NUM_STAGES: u64 = 3;

/// The identifier of a peer. Stable for the lifetime of the peer process.
pub type PeerId = String;

/// The hex encoded hash of a question, used as the sub-key of an output record.
pub type QuestionHash = String;

/// The cumulative reward of every peer during one `(round, stage)`.
pub type RewardRecord = BTreeMap<PeerId, f64>;

/// The outputs of one peer during one `(round, stage)`, keyed by question hash.
pub type OutputRecord = BTreeMap<QuestionHash, TimedOutput>;

/// A position in the training schedule.
///
/// The ordering is lexicographic, first by round then by stage. On the wire it is encoded as the
/// pair `[round, stage]`.
#[derive(
    Clone, Copy, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[display(fmt = "({}, {})", round, stage)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct RoundStage {
    pub round: u64,
    pub stage: u64,
}

impl RoundStage {
    pub const fn new(round: u64, stage: u64) -> Self {
        Self { round, stage }
    }

    /// Checks whether this is the last stage of its round.
    pub fn is_final_stage(&self) -> bool {
        self.stage + 1 >= NUM_STAGES
    }

    /// The stage that precedes this one within the same round, if any.
    pub fn previous_in_round(&self) -> Option<Self> {
        self.stage
            .checked_sub(1)
            .map(|stage| Self::new(self.round, stage))
    }

    /// The position immediately before this one.
    ///
    /// The predecessor of stage `0` is the final stage of the previous round. Round `0` has no
    /// previous round, so the result is clamped to `(0, 0)`.
    pub fn previous(&self) -> Self {
        match self.previous_in_round() {
            Some(previous) => previous,
            None if self.round == 0 => Self::new(0, 0),
            None => Self::new(self.round - 1, NUM_STAGES - 1),
        }
    }
}

impl From<(u64, u64)> for RoundStage {
    fn from((round, stage): (u64, u64)) -> Self {
        Self { round, stage }
    }
}

impl From<RoundStage> for (u64, u64) {
    fn from(rs: RoundStage) -> Self {
        (rs.round, rs.stage)
    }
}
