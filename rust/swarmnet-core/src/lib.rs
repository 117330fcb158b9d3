#![cfg_attr(docsrs, feature(doc_cfg))]
//! # swarmnet-core
//!
//! The shared data model of a training swarm. Independent peers cooperate over multiple
//! *rounds*, each split into ordered *stages*. They never talk to each other directly: every
//! intermediate result is exchanged through a shared key-value store with expiring entries.
//!
//! This crate holds the types those peers agree on:
//!
//! - [`RoundStage`]: a position in the training schedule.
//! - [`StageOutput`]: the stage-shaped output objects peers publish, one variant per stage.
//! - [`RewardRecord`] and [`OutputRecord`]: the shapes of the shared records.
//! - [`leaderboard`] and [`gossip`]: the derived views served to dashboards.
//! - [`names`]: deterministic, human readable peer nicknames.
//!
//! It performs no I/O. Store access, merging and orchestration live in `swarmnet-server`.

pub mod common;
pub mod gossip;
pub mod hash;
pub mod leaderboard;
pub mod names;
pub mod output;

pub use self::{
    common::{OutputRecord, PeerId, QuestionHash, RewardRecord, RoundStage, NUM_STAGES},
    hash::ContentHash,
    output::{
        OutputError,
        StageOneOutput,
        StageOutput,
        StageTwoOutput,
        StageZeroOutput,
        TimedOutput,
        NO_ANSWER,
        NO_FEEDBACK,
    },
};
