//! Scoring of stage contributions.

use swarmnet_core::StageOutput;

/// Rates the contribution of a peer to a merged record.
///
/// This is the only scoring path: training collaborators rate their outputs with it and the
/// coordinator re-evaluates the final stage with it to pick the round winners.
pub trait RewardScorer: Send + Sync {
    /// The reward of `peer_id`'s contribution to `record`, a record of the given stage.
    fn score(&self, stage: u64, record: &StageOutput, peer_id: &str) -> f64;
}

/// The tag lines every stage's completions are expected to carry.
///
/// Each line counts once. The last tag of a stage additionally penalizes text trailing its
/// closing line.
struct StageFormat {
    lines: &'static [&'static str],
    last: &'static str,
}

const FORMATS: [StageFormat; 3] = [
    StageFormat {
        lines: &["<think>\n", "\n</think>\n"],
        last: "answer",
    },
    StageFormat {
        lines: &["<compare>\n", "\n</compare>\n", "<explain>\n", "\n</explain>\n"],
        last: "identify",
    },
    StageFormat {
        lines: &[
            "<summarize_feedback>\n",
            "\n</summarize_feedback>\n",
            "<majority>\n",
            "\n</majority>\n",
            "<question>\n",
            "\n</question>\n",
            "<think>\n",
            "\n</think>\n",
        ],
        last: "answer",
    },
];

const TAG_REWARD: f64 = 0.125;
const TRAILING_PENALTY: f64 = 0.001;
const CORRECTNESS_REWARD: f64 = 1.0;

/// Scores the XML layout of a completion and the correctness of its `<answer>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FormatScorer;

impl FormatScorer {
    /// Rates how well `text` follows the tag layout of `stage`.
    pub fn format_score(stage: u64, text: &str) -> f64 {
        let format = match FORMATS.get(stage as usize) {
            Some(format) => format,
            None => return 0.,
        };

        let mut score = format
            .lines
            .iter()
            .filter(|line| text.matches(*line).count() == 1)
            .count() as f64
            * TAG_REWARD;

        let open = format!("\n<{}>\n", format.last);
        let close = format!("\n</{}>", format.last);
        if text.matches(open.as_str()).count() == 1 {
            score += TAG_REWARD;
            score -= trailing(text, &format!("{}\n", close)) as f64 * TRAILING_PENALTY;
        }
        if text.matches(close.as_str()).count() == 1 {
            score += TAG_REWARD;
            score -= (trailing(text, &close) as f64 - 1.) * TRAILING_PENALTY;
        }
        score
    }
}

impl RewardScorer for FormatScorer {
    fn score(&self, stage: u64, record: &StageOutput, peer_id: &str) -> f64 {
        let text = match record.contribution(peer_id) {
            Some(text) => text,
            None => return 0.,
        };
        let mut score = Self::format_score(stage, text);
        if let Some(answer) = extract_tag(text, "answer") {
            if !record.answer().is_empty() && answer == record.answer().trim() {
                score += CORRECTNESS_REWARD;
            }
        }
        score
    }
}

/// The number of characters after the last occurrence of `separator`, or of the whole text if it
/// does not occur.
fn trailing(text: &str, separator: &str) -> usize {
    text.rsplit(separator)
        .next()
        .map(|rest| rest.chars().count())
        .unwrap_or_default()
}

/// The trimmed content of the last `<tag>` of `text`, up to the following closing tag.
pub fn extract_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let (_, content) = text.rsplit_once(open.as_str())?;
    let content = content
        .split_once(close.as_str())
        .map_or(content, |(content, _)| content);
    Some(content.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmnet_core::{StageZeroOutput, NO_ANSWER};

    const WELL_FORMED: &str = "<think>\nadd them\n</think>\n<answer>\n4\n</answer>\n";

    fn record(answer: &str) -> StageOutput {
        StageOutput::from(StageZeroOutput {
            question: "2 + 2?".into(),
            answer: "4".into(),
            agent_answers: vec![
                ("good".to_string(), WELL_FORMED.to_string()),
                ("bad".to_string(), answer.to_string()),
            ]
            .into_iter()
            .collect(),
        })
    }

    #[test]
    fn test_well_formed_completion() {
        // four lines, no trailing text: (1 - 1) chars after "\n</answer>"
        let score = FormatScorer::format_score(0, WELL_FORMED);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_text_is_penalized() {
        let trailing = format!("{}0123456789", WELL_FORMED);
        let score = FormatScorer::format_score(0, &trailing);
        assert!((score - (0.5 - 0.010 - 0.010)).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_stage() {
        assert_eq!(FormatScorer::format_score(7, WELL_FORMED), 0.);
    }

    #[test]
    fn test_correctness() {
        let record = record(NO_ANSWER);
        let good = FormatScorer.score(0, &record, "good");
        assert!((good - 1.5).abs() < 1e-9);
        assert_eq!(FormatScorer.score(0, &record, "bad"), 0.);
        assert_eq!(FormatScorer.score(0, &record, "absent"), 0.);
    }

    #[test]
    fn test_extract_tag() {
        assert_eq!(extract_tag(WELL_FORMED, "answer"), Some("4"));
        assert_eq!(extract_tag("<identify>Student #1", "identify"), Some("Student #1"));
        assert_eq!(extract_tag("nothing", "answer"), None);
    }
}
