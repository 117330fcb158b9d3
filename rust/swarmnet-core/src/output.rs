//! Stage-shaped peer outputs.
//!
//! Each stage of a round produces a differently shaped output object. They share the `question`
//! and reference `answer` fields and carry exactly one per-peer mapping:
//!
//! | stage | prompt field    | per-peer field         |
//! |-------|-----------------|------------------------|
//! | 0     | -               | `agent_answers`        |
//! | 1     | `stage2_prompt` | `agent_opinion`        |
//! | 2     | `stage3_prompt` | `final_agent_decision` |
//!
//! Missing fields deserialize to their empty defaults and unknown fields are ignored, so outputs
//! written by newer or older peers still decode.

use std::collections::BTreeMap;

use derive_more::From;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::common::PeerId;

/// Placeholder for a participant that did not contribute an answer or decision.
pub const NO_ANSWER: &str = "No answer received...";

/// Placeholder for a participant that did not contribute an opinion.
pub const NO_FEEDBACK: &str = "No feedback received...";

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("no output shape is defined for stage {0}")]
    UnknownStage(u64),
    #[error("malformed output for stage {stage}: {source}")]
    Malformed {
        stage: u64,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageZeroOutput {
    pub question: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub agent_answers: BTreeMap<PeerId, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOneOutput {
    pub question: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage2_prompt: Option<String>,
    #[serde(default)]
    pub agent_opinion: BTreeMap<PeerId, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTwoOutput {
    pub question: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage3_prompt: Option<String>,
    #[serde(default)]
    pub final_agent_decision: BTreeMap<PeerId, String>,
}

/// An output of any stage.
///
/// The wire format carries no tag, the stage is known from the key the output is stored under.
/// Use [`StageOutput::from_value`] to decode.
#[derive(Clone, Debug, PartialEq, Serialize, From)]
#[serde(untagged)]
pub enum StageOutput {
    Zero(StageZeroOutput),
    One(StageOneOutput),
    Two(StageTwoOutput),
}

impl StageOutput {
    /// Decodes the output of the given stage from a JSON value.
    pub fn from_value(stage: u64, value: Value) -> Result<Self, OutputError> {
        let malformed = |source| OutputError::Malformed { stage, source };
        match stage {
            0 => serde_json::from_value(value)
                .map(Self::Zero)
                .map_err(malformed),
            1 => serde_json::from_value(value)
                .map(Self::One)
                .map_err(malformed),
            2 => serde_json::from_value(value)
                .map(Self::Two)
                .map_err(malformed),
            _ => Err(OutputError::UnknownStage(stage)),
        }
    }

    pub fn stage(&self) -> u64 {
        match self {
            Self::Zero(_) => 0,
            Self::One(_) => 1,
            Self::Two(_) => 2,
        }
    }

    pub fn question(&self) -> &str {
        match self {
            Self::Zero(output) => &output.question,
            Self::One(output) => &output.question,
            Self::Two(output) => &output.question,
        }
    }

    /// The reference answer of the question.
    pub fn answer(&self) -> &str {
        match self {
            Self::Zero(output) => &output.answer,
            Self::One(output) => &output.answer,
            Self::Two(output) => &output.answer,
        }
    }

    /// The prompt text carried forward to the next stage, if any.
    pub fn prompt(&self) -> Option<&str> {
        match self {
            Self::Zero(_) => None,
            Self::One(output) => output.stage2_prompt.as_deref(),
            Self::Two(output) => output.stage3_prompt.as_deref(),
        }
    }

    /// The per-peer mapping of this stage.
    pub fn contributions(&self) -> &BTreeMap<PeerId, String> {
        match self {
            Self::Zero(output) => &output.agent_answers,
            Self::One(output) => &output.agent_opinion,
            Self::Two(output) => &output.final_agent_decision,
        }
    }

    pub fn contributions_mut(&mut self) -> &mut BTreeMap<PeerId, String> {
        match self {
            Self::Zero(output) => &mut output.agent_answers,
            Self::One(output) => &mut output.agent_opinion,
            Self::Two(output) => &mut output.final_agent_decision,
        }
    }

    pub fn contribution(&self, peer_id: &str) -> Option<&str> {
        self.contributions().get(peer_id).map(String::as_str)
    }

    /// The placeholder inserted for a participant missing from [`contributions()`].
    ///
    /// [`contributions()`]: StageOutput::contributions
    pub fn sentinel(&self) -> &'static str {
        match self {
            Self::One(_) => NO_FEEDBACK,
            Self::Zero(_) | Self::Two(_) => NO_ANSWER,
        }
    }

    /// Folds another output of the same question into this one.
    ///
    /// The shared fields are overwritten by non-empty values of `other` and its per-peer entries
    /// are added. Outputs of a different stage are ignored.
    pub fn absorb(&mut self, other: &StageOutput) {
        if self.stage() != other.stage() {
            return;
        }
        match (self, other) {
            (Self::Zero(this), Self::Zero(other)) => {
                overwrite(&mut this.question, &other.question);
                overwrite(&mut this.answer, &other.answer);
                extend(&mut this.agent_answers, &other.agent_answers);
            }
            (Self::One(this), Self::One(other)) => {
                overwrite(&mut this.question, &other.question);
                overwrite(&mut this.answer, &other.answer);
                if other.stage2_prompt.is_some() {
                    this.stage2_prompt = other.stage2_prompt.clone();
                }
                extend(&mut this.agent_opinion, &other.agent_opinion);
            }
            (Self::Two(this), Self::Two(other)) => {
                overwrite(&mut this.question, &other.question);
                overwrite(&mut this.answer, &other.answer);
                if other.stage3_prompt.is_some() {
                    this.stage3_prompt = other.stage3_prompt.clone();
                }
                extend(&mut this.final_agent_decision, &other.final_agent_decision);
            }
            _ => {}
        }
    }
}

fn overwrite(field: &mut String, value: &str) {
    if !value.is_empty() {
        *field = value.to_string();
    }
}

fn extend(map: &mut BTreeMap<PeerId, String>, other: &BTreeMap<PeerId, String>) {
    map.extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// An output together with the store time at which it was produced.
///
/// Encoded as the pair `[timestamp, output]`.
#[derive(Clone, Debug, PartialEq)]
pub struct TimedOutput {
    pub timestamp: f64,
    pub output: StageOutput,
}

impl TimedOutput {
    pub fn new(timestamp: f64, output: impl Into<StageOutput>) -> Self {
        Self {
            timestamp,
            output: output.into(),
        }
    }

    /// Decodes a timed output of the given stage from a JSON value.
    pub fn from_value(stage: u64, value: Value) -> Result<Self, OutputError> {
        let (timestamp, output): (f64, Value) = serde_json::from_value(value)
            .map_err(|source| OutputError::Malformed { stage, source })?;
        Ok(Self {
            timestamp,
            output: StageOutput::from_value(stage, output)?,
        })
    }
}

impl Serialize for TimedOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.timestamp, &self.output).serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_by_stage() {
        let value = json!({
            "question": "q",
            "answer": "42",
            "stage2_prompt": "p",
            "agent_opinion": {"a": "opinion"},
            "something_else": 1,
        });
        let output = StageOutput::from_value(1, value).unwrap();
        assert_eq!(output.stage(), 1);
        assert_eq!(output.prompt(), Some("p"));
        assert_eq!(output.contribution("a"), Some("opinion"));
        assert_eq!(output.sentinel(), NO_FEEDBACK);
    }

    #[test]
    fn test_decode_tolerates_missing_fields() {
        let output = StageOutput::from_value(2, json!({"question": "q"})).unwrap();
        assert_eq!(output.answer(), "");
        assert!(output.contributions().is_empty());
        assert_eq!(output.prompt(), None);
    }

    #[test]
    fn test_decode_rejects_unknown_stage() {
        assert!(matches!(
            StageOutput::from_value(3, json!({"question": "q"})),
            Err(OutputError::UnknownStage(3))
        ));
        assert!(matches!(
            StageOutput::from_value(0, json!({"answer": "no question"})),
            Err(OutputError::Malformed { stage: 0, .. })
        ));
    }

    #[test]
    fn test_timed_output_wire_format() {
        let timed = TimedOutput::new(
            12.5,
            StageZeroOutput {
                question: "q".into(),
                answer: "a".into(),
                agent_answers: vec![("p".to_string(), "x".to_string())].into_iter().collect(),
            },
        );
        let value = serde_json::to_value(&timed).unwrap();
        assert_eq!(
            value,
            json!([12.5, {"question": "q", "answer": "a", "agent_answers": {"p": "x"}}])
        );
        assert_eq!(TimedOutput::from_value(0, value).unwrap(), timed);
    }

    #[test]
    fn test_absorb() {
        let mut merged = StageOutput::from(StageOneOutput {
            question: "q".into(),
            answer: "a".into(),
            stage2_prompt: None,
            agent_opinion: vec![("x".to_string(), "1".to_string())].into_iter().collect(),
        });
        merged.absorb(&StageOutput::from(StageOneOutput {
            question: "q".into(),
            answer: String::new(),
            stage2_prompt: Some("prompt".into()),
            agent_opinion: vec![("y".to_string(), "2".to_string())].into_iter().collect(),
        }));
        merged.absorb(&StageOutput::from(StageZeroOutput::default()));

        assert_eq!(merged.answer(), "a");
        assert_eq!(merged.prompt(), Some("prompt"));
        assert_eq!(merged.contributions().len(), 2);
    }
}
