//! Merging of the outputs that peers published for a stage.
//!
//! Peers answer the same questions independently. Before a stage can start, the outputs of the
//! previous stage are combined into one record per question:
//!
//! 1. The reward record of the previous stage is the authoritative set of participants. A peer
//!    with a reward entry is expected to have published outputs, even if they cannot be read.
//! 2. The outputs of all participants are grouped by their `question` field.
//! 3. Every group is folded into one record. The shared fields come from any contributor, the
//!    per-peer mappings are united.
//! 4. Every participant missing from a record's per-peer mapping is filled in with a placeholder,
//!    so consumers can index a record by any participant.
//!
//! The local outputs of the merging peer take precedence over what the store returns for it.

pub mod prompts;
pub mod selection;

use std::collections::BTreeMap;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use swarmnet_core::{OutputRecord, PeerId, RoundStage, StageOutput};

pub use self::{
    prompts::{build_samples, stage2_user_prompt, stage3_user_prompt, StageSample},
    selection::{select_contributions, Selection},
};
use crate::storage::{StorageError, SwarmStorage, SwarmStore};

/// Errors of a merge attempt.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("stage {0} has no previous stage to merge")]
    NoPreviousStage(RoundStage),
    #[error("no participants are recorded for {0}")]
    MissingParticipants(RoundStage),
    #[error("fetching the participants failed: {0}")]
    Storage(#[from] StorageError),
}

impl MergeError {
    /// Checks whether the data the merge depends on is not available (yet).
    pub fn is_missing_data(&self) -> bool {
        matches!(self, Self::MissingParticipants(_))
    }
}

/// Groups the outputs of all peers by question.
///
/// If a peer has several outputs for the same question, the most recent one is kept.
pub fn group_by_question(
    outputs: &BTreeMap<PeerId, OutputRecord>,
) -> BTreeMap<String, BTreeMap<PeerId, StageOutput>> {
    let mut latest: BTreeMap<(&str, &PeerId), (f64, &StageOutput)> = BTreeMap::new();
    for (peer_id, record) in outputs {
        for timed in record.values() {
            let key = (timed.output.question(), peer_id);
            match latest.get(&key) {
                Some((timestamp, _)) if *timestamp >= timed.timestamp => {}
                _ => {
                    latest.insert(key, (timed.timestamp, &timed.output));
                }
            }
        }
    }

    let mut grouped: BTreeMap<String, BTreeMap<PeerId, StageOutput>> = BTreeMap::new();
    for ((question, peer_id), (_, output)) in latest {
        grouped
            .entry(question.to_string())
            .or_default()
            .insert(peer_id.clone(), output.clone());
    }
    grouped
}

/// Folds the contributions of all peers to one question into a single record.
///
/// Every participant without an entry in the per-peer mapping gets the stage's placeholder.
/// Returns `None` if there are no contributions.
pub fn merge_question(
    contributions: &BTreeMap<PeerId, StageOutput>,
    participants: &[PeerId],
) -> Option<StageOutput> {
    let mut outputs = contributions.values();
    let mut merged = outputs.next()?.clone();
    for output in outputs {
        merged.absorb(output);
    }

    let sentinel = merged.sentinel();
    let mapping = merged.contributions_mut();
    for peer_id in participants {
        mapping
            .entry(peer_id.clone())
            .or_insert_with(|| sentinel.to_string());
    }
    Some(merged)
}

/// Merges the outputs of all peers into one record per question, ordered by question.
pub fn merge_outputs(
    outputs: &BTreeMap<PeerId, OutputRecord>,
    participants: &[PeerId],
) -> Vec<StageOutput> {
    group_by_question(outputs)
        .values()
        .filter_map(|contributions| merge_question(contributions, participants))
        .collect()
}

/// Merges the outputs published for the stage preceding `round_stage`.
///
/// `local` holds the outputs of the peer `self_id` for that stage, which replace the store's
/// entries for the same questions.
///
/// # Errors
/// Fails if `round_stage` is the first stage of its round, see [`merge_stage()`] otherwise.
pub async fn merge_previous_stage<S>(
    store: &mut SwarmStore<S>,
    self_id: &str,
    local: Option<&OutputRecord>,
    round_stage: RoundStage,
) -> Result<Vec<StageOutput>, MergeError>
where
    S: SwarmStorage,
{
    let previous = round_stage
        .previous_in_round()
        .ok_or(MergeError::NoPreviousStage(round_stage))?;
    merge_stage(store, self_id, local, previous).await
}

/// Merges the outputs published for `round_stage`.
///
/// # Errors
/// Fails if the participants of `round_stage` are unknown or if reading them fails. A
/// participant whose outputs cannot be read only shows up as placeholders.
pub async fn merge_stage<S>(
    store: &mut SwarmStore<S>,
    self_id: &str,
    local: Option<&OutputRecord>,
    round_stage: RoundStage,
) -> Result<Vec<StageOutput>, MergeError>
where
    S: SwarmStorage,
{
    let participants = match store.participants(round_stage).await? {
        Some(participants) if !participants.is_empty() => participants,
        _ => return Err(MergeError::MissingParticipants(round_stage)),
    };
    debug!(
        "merging the outputs of {} participants of {}",
        participants.len(),
        round_stage
    );

    // the storage bounds the number of concurrent requests
    let fetches = participants.iter().map(|peer_id| {
        let mut store = store.clone();
        async move { (peer_id, store.outputs(peer_id, round_stage).await) }
    });
    let fetched = join_all(fetches).await;

    let mut outputs = BTreeMap::new();
    for (peer_id, fetched) in fetched {
        let mut record = match fetched {
            Ok(record) => record.unwrap_or_default(),
            Err(err) => {
                warn!("failed to fetch the outputs of {}: {}", peer_id, err);
                OutputRecord::new()
            }
        };
        if peer_id == self_id {
            if let Some(local) = local {
                record.extend(local.iter().map(|(hash, output)| (hash.clone(), output.clone())));
            }
        }
        if record.is_empty() {
            debug!("no outputs of {} for {}", peer_id, round_stage);
        }
        outputs.insert(peer_id.clone(), record);
    }

    Ok(merge_outputs(&outputs, &participants))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        storage::MemoryStore,
        utils::{Clock, ManualClock},
    };
    use swarmnet_core::{
        hash::question_hash,
        StageOneOutput,
        StageZeroOutput,
        TimedOutput,
        NO_ANSWER,
        NO_FEEDBACK,
    };

    fn answer(peer_id: &str, question: &str, answer: &str) -> TimedOutput {
        TimedOutput::new(
            1.,
            StageZeroOutput {
                question: question.into(),
                answer: "4".into(),
                agent_answers: vec![(peer_id.to_string(), answer.to_string())]
                    .into_iter()
                    .collect(),
            },
        )
    }

    fn record(outputs: Vec<TimedOutput>) -> OutputRecord {
        outputs
            .into_iter()
            .map(|output| (question_hash(output.output.question()), output))
            .collect()
    }

    fn store() -> SwarmStore<MemoryStore> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(100.));
        SwarmStore::new(MemoryStore::new(clock.clone()), clock)
    }

    #[test]
    fn test_missing_participant_is_filled() {
        let mut outputs = BTreeMap::new();
        outputs.insert("A".to_string(), record(vec![answer("A", "q", "<answer>4</answer>")]));
        let participants = vec!["A".to_string(), "B".to_string()];

        let merged = merge_outputs(&outputs, &participants);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].contribution("A"), Some("<answer>4</answer>"));
        assert_eq!(merged[0].contribution("B"), Some(NO_ANSWER));
    }

    #[test]
    fn test_every_participant_is_present() {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "A".to_string(),
            record(vec![answer("A", "q1", "a1"), answer("A", "q2", "a2")]),
        );
        outputs.insert("B".to_string(), record(vec![answer("B", "q2", "b2")]));
        outputs.insert("C".to_string(), OutputRecord::new());
        let participants = vec!["A".to_string(), "B".to_string(), "C".to_string()];

        let merged = merge_outputs(&outputs, &participants);
        assert_eq!(merged.len(), 2);
        for record in &merged {
            for peer_id in &participants {
                assert!(record.contribution(peer_id).is_some());
            }
        }
        assert_eq!(merged[1].question(), "q2");
        assert_eq!(merged[1].contribution("B"), Some("b2"));
        assert_eq!(merged[1].contribution("C"), Some(NO_ANSWER));
    }

    #[test]
    fn test_opinion_placeholder() {
        let mut contributions = BTreeMap::new();
        contributions.insert(
            "A".to_string(),
            StageOutput::from(StageOneOutput {
                question: "q".into(),
                answer: "4".into(),
                stage2_prompt: Some("prompt".into()),
                agent_opinion: vec![("A".to_string(), "fine".to_string())]
                    .into_iter()
                    .collect(),
            }),
        );
        let merged = merge_question(&contributions, &["A".to_string(), "B".to_string()]).unwrap();
        assert_eq!(merged.contribution("B"), Some(NO_FEEDBACK));
        assert_eq!(merged.prompt(), Some("prompt"));
        assert!(merge_question(&BTreeMap::new(), &["A".to_string()]).is_none());
    }

    #[test]
    fn test_latest_duplicate_wins() {
        let mut old = answer("A", "q", "old");
        old.timestamp = 1.;
        let mut new = answer("A", "q", "new");
        new.timestamp = 2.;
        let mut record = OutputRecord::new();
        record.insert("new".to_string(), new);
        record.insert("old".to_string(), old);
        let mut outputs = BTreeMap::new();
        outputs.insert("A".to_string(), record);

        let grouped = group_by_question(&outputs);
        assert_eq!(grouped["q"]["A"].contribution("A"), Some("new"));
    }

    #[tokio::test]
    async fn test_merge_previous_stage() {
        let mut store = store();
        let previous = RoundStage::new(0, 0);
        store.publish_reward(previous, "A", 1.).await.unwrap();
        store.publish_reward(previous, "B", 2.).await.unwrap();
        store
            .publish_output("A", previous, &answer("A", "q", "from store"))
            .await
            .unwrap();

        let local = record(vec![answer("A", "q", "from cache")]);
        let merged = merge_previous_stage(&mut store, "A", Some(&local), RoundStage::new(0, 1))
            .await
            .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].contribution("A"), Some("from cache"));
        assert_eq!(merged[0].contribution("B"), Some(NO_ANSWER));
    }

    #[tokio::test]
    async fn test_merge_without_participants() {
        let mut store = store();
        let err = merge_previous_stage(&mut store, "A", None, RoundStage::new(3, 1))
            .await
            .unwrap_err();
        assert!(err.is_missing_data());
        assert!(matches!(
            err,
            MergeError::MissingParticipants(rs) if rs == RoundStage::new(3, 0)
        ));

        let err = merge_previous_stage(&mut store, "A", None, RoundStage::new(3, 0))
            .await
            .unwrap_err();
        assert!(!err.is_missing_data());
    }
}
