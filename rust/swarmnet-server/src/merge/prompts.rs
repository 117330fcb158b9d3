//! Prompt assembly for the stages that build on merged records.

use std::fmt::Write;

use rand::Rng;

use swarmnet_core::{PeerId, StageOutput};

use crate::{merge::selection::select_contributions, settings::MergeSettings};

/// One training example of a stage: a merged record of the previous stage and the prompt built
/// from it.
#[derive(Clone, Debug, PartialEq)]
pub struct StageSample {
    pub record: StageOutput,
    /// Absent for stage 0 records of the dataset and for records of the final stage.
    pub prompt: Option<String>,
}

impl StageSample {
    pub fn question(&self) -> &str {
        self.record.question()
    }
}

/// The prompt that presents the answers of the previous stage.
pub fn stage2_user_prompt<'a>(
    question: &str,
    answers: impl IntoIterator<Item = (&'a PeerId, &'a String)>,
) -> String {
    let mut prompt = format!(
        "The question we were given is: {}  \n\nThe following answers to this question were suggested: \n",
        question
    );
    for (i, (_, answer)) in answers.into_iter().enumerate() {
        let _ = write!(
            prompt,
            "<student>Student #{}</student> said \n{}\n\n\n",
            i, answer
        );
    }
    prompt
}

/// The prompt that presents the opinions on a previous [`stage2_user_prompt`].
pub fn stage3_user_prompt<'a>(
    stage2_prompt: &str,
    opinions: impl IntoIterator<Item = (&'a PeerId, &'a String)>,
) -> String {
    let mut prompt = format!(
        "{}  \nAfter comparing these answers, the following feedback was given about which answer is best: \n",
        stage2_prompt
    );
    for (i, (_, opinion)) in opinions.into_iter().enumerate() {
        let _ = write!(
            prompt,
            "<criticism>Criticism #{}</criticism> was \n{}\n\n\n",
            i, opinion
        );
    }
    prompt
}

/// Turns the merged records of a stage into the samples of the next one.
///
/// The contributions shown in a prompt are picked according to `settings`, `score` rates one
/// contribution of a record for [`Selection::TopK`].
///
/// [`Selection::TopK`]: crate::merge::Selection::TopK
pub fn build_samples<F, R>(
    records: Vec<StageOutput>,
    settings: &MergeSettings,
    mut score: F,
    rng: &mut R,
) -> Vec<StageSample>
where
    F: FnMut(&StageOutput, &str) -> f64,
    R: Rng + ?Sized,
{
    records
        .into_iter()
        .map(|record| {
            let prompt = {
                let selected = select_contributions(
                    record.contributions(),
                    settings.selection,
                    settings.max_contributions,
                    |peer_id, _| score(&record, peer_id),
                    &mut *rng,
                );
                match &record {
                    StageOutput::Zero(output) => {
                        Some(stage2_user_prompt(&output.question, selected))
                    }
                    StageOutput::One(output) => Some(stage3_user_prompt(
                        output.stage2_prompt.as_deref().unwrap_or_default(),
                        selected,
                    )),
                    StageOutput::Two(_) => None,
                }
            };
            StageSample { record, prompt }
        })
        .collect()
}
