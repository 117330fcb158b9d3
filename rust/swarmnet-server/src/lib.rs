#![cfg_attr(docsrs, feature(doc_cfg))]
//! # swarmnet-server
//!
//! The coordination layer of a training swarm. Peers train on the same questions, round after
//! round, in three stages:
//!
//! 0. every peer answers the questions of its dataset on its own,
//! 1. every peer critiques the merged answers of stage 0,
//! 2. every peer decides on a majority from the merged critiques of stage 1.
//!
//! Peers never talk to each other. They exchange their outputs, rewards and the round/stage
//! counter through a shared store with expiring entries, see [`storage`].
//!
//! ## Peers
//!
//! The [`state_machine::Orchestrator`] drives a peer through the schedule. Before a stage starts
//! it merges what the swarm published for the previous stage ([`merge`]), trains on the merged
//! records and publishes its own outputs and rewards ([`rewards`]). Exactly one peer of a swarm
//! is the coordinator: it advances the counter and submits the winners of each round to the
//! [`coordinator`] service. All other peers follow the counter, joining late rounds and
//! recovering from missed stages.
//!
//! ## Dashboard
//!
//! A dashboard process polls the store into a [`cache::SwarmCache`] and serves leaderboards and
//! a sample of recent outputs over the [`rest`] API.
//!
//! Both processes are configured through [`settings`].

pub mod cache;
pub mod coordinator;
pub mod merge;
pub mod rest;
pub mod rewards;
pub mod settings;
pub mod state_machine;
pub mod storage;
pub mod utils;
