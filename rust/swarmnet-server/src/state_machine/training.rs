//! The training step of a stage.
//!
//! The orchestrator never looks into training. It hands a [`TrainingStep`] the samples of a stage
//! and receives the step's progress through a [`ProgressSink`].

use std::{fs, io, path::Path, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use swarmnet_core::{
    RoundStage,
    StageOneOutput,
    StageOutput,
    StageTwoOutput,
    StageZeroOutput,
};

use crate::{
    merge::StageSample,
    rewards::{extract_tag, RewardScorer},
    storage::StorageError,
};

/// Error returned by a [`TrainingStep`].
#[derive(Debug, Error)]
pub enum TrainingError {
    /// A transient failure of the transport between the trainer and the swarm.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("publishing the progress failed: {0}")]
    Store(#[from] StorageError),

    #[error("training failed: {0}")]
    Failed(String),
}

impl TrainingError {
    /// Checks whether the training step may succeed when attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Store(_))
    }
}

/// One increment of a stage's training.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    /// The rewards of the examples trained on in this increment.
    pub rewards: Vec<f64>,
    /// The output produced in this increment.
    pub output: Option<StageOutput>,
}

/// Receives the progress of a training step.
#[async_trait]
pub trait ProgressSink: Send {
    async fn report(&mut self, progress: Progress) -> Result<(), TrainingError>;
}

/// The input of a stage's training step.
#[derive(Clone, Debug)]
pub struct StageInput {
    pub round_stage: RoundStage,
    pub samples: Vec<StageSample>,
}

/// The training work of a peer.
#[async_trait]
pub trait TrainingStep: Send {
    /// Trains one stage on `input`, reporting every increment to `sink`.
    async fn train(
        &mut self,
        input: &StageInput,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TrainingError>;

    /// Releases the caches of the trainer. Called at the end of every round and between failed
    /// attempts.
    fn cleanup(&mut self) {}
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("reading the dataset failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed dataset: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("the dataset is empty")]
    Empty,
}

#[derive(Deserialize)]
struct Example {
    question: String,
    answer: String,
}

/// Loads the stage 0 samples from a JSON list of `{"question": ..., "answer": ...}` objects.
pub fn load_dataset(path: impl AsRef<Path>) -> Result<Vec<StageSample>, DatasetError> {
    let examples: Vec<Example> = serde_json::from_slice(&fs::read(path)?)?;
    if examples.is_empty() {
        return Err(DatasetError::Empty);
    }
    Ok(examples
        .into_iter()
        .map(|Example { question, answer }| sample(question, answer))
        .collect())
}

/// A small arithmetic dataset for simulations without a configured dataset.
pub fn default_dataset() -> Vec<StageSample> {
    [
        ("What is 12 plus 30?", "42"),
        ("A farmer has 3 fields with 7 cows each. How many cows are there?", "21"),
        ("Sam reads 15 pages a day. How many pages does Sam read in 4 days?", "60"),
    ]
    .iter()
    .map(|(question, answer)| sample(question.to_string(), answer.to_string()))
    .collect()
}

fn sample(question: String, answer: String) -> StageSample {
    StageSample {
        record: StageOutput::from(StageZeroOutput {
            question,
            answer,
            agent_answers: Default::default(),
        }),
        prompt: None,
    }
}

/// A trainer without a model.
///
/// It answers every sample deterministically in the expected format of the stage, which makes the
/// full publish and merge path of a swarm observable without any training.
pub struct DryRunTrainer {
    peer_id: String,
    scorer: Arc<dyn RewardScorer>,
}

impl DryRunTrainer {
    pub fn new(peer_id: impl Into<String>, scorer: Arc<dyn RewardScorer>) -> Self {
        Self {
            peer_id: peer_id.into(),
            scorer,
        }
    }

    fn respond(&self, sample: &StageSample) -> Option<StageOutput> {
        let record = &sample.record;
        let question = record.question().to_string();
        let answer = record.answer().to_string();
        let mapping = |text: String| vec![(self.peer_id.clone(), text)].into_iter().collect();

        match record {
            StageOutput::Zero(_) if sample.prompt.is_none() => {
                Some(StageOutput::from(StageZeroOutput {
                    agent_answers: mapping(format!(
                        "<think>\nThe question asks: {}\n</think>\n<answer>\n{}\n</answer>\n",
                        question, answer
                    )),
                    question,
                    answer,
                }))
            }
            StageOutput::Zero(input) => {
                let best = input
                    .agent_answers
                    .values()
                    .position(|text| extract_tag(text, "answer") == Some(answer.as_str()))
                    .unwrap_or_default();
                Some(StageOutput::from(StageOneOutput {
                    agent_opinion: mapping(format!(
                        "<compare>\n{} answers were suggested\n</compare>\n\
                         <explain>\nStudent #{} reached the reference result\n</explain>\n\
                         <identify>\nStudent #{}\n</identify>\n",
                        input.agent_answers.len(),
                        best,
                        best
                    )),
                    stage2_prompt: sample.prompt.clone(),
                    question,
                    answer,
                }))
            }
            StageOutput::One(input) => {
                let majority = majority_choice(input.agent_opinion.values());
                Some(StageOutput::from(StageTwoOutput {
                    final_agent_decision: mapping(format!(
                        "<summarize_feedback>\n{} opinions were given\n</summarize_feedback>\n\
                         <majority>\n{}\n</majority>\n\
                         <question>\n{}\n</question>\n\
                         <think>\nFollowing the majority\n</think>\n\
                         <answer>\n{}\n</answer>\n",
                        input.agent_opinion.len(),
                        majority,
                        question,
                        answer
                    )),
                    stage3_prompt: sample.prompt.clone(),
                    question,
                    answer,
                }))
            }
            StageOutput::Two(_) => None,
        }
    }
}

/// The most frequent `<identify>` choice among `opinions`, the smallest one on ties.
fn majority_choice<'a>(opinions: impl Iterator<Item = &'a String>) -> String {
    let mut counts = std::collections::BTreeMap::new();
    for choice in opinions.filter_map(|opinion| extract_tag(opinion, "identify")) {
        *counts.entry(choice).or_insert(0usize) += 1;
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(&str, usize)>, (choice, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((choice, count)),
        })
        .map(|(choice, _)| choice.to_string())
        .unwrap_or_else(|| "Student #0".to_string())
}

#[async_trait]
impl TrainingStep for DryRunTrainer {
    async fn train(
        &mut self,
        input: &StageInput,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TrainingError> {
        for sample in &input.samples {
            let output = match self.respond(sample) {
                Some(output) => output,
                None => continue,
            };
            let reward = self
                .scorer
                .score(input.round_stage.stage, &output, &self.peer_id);
            sink.report(Progress {
                rewards: vec![reward],
                output: Some(output),
            })
            .await?;
        }
        Ok(())
    }
}
