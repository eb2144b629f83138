//! Sentence model for sentence-level prompt optimization
//!
//! A prompt is split into ordered `(content, suffix)` pairs. Concatenating
//! every pair in order gives back the original text.

use crate::context::{Role, RunContext};
use crate::error::ApoError;
use crate::generation::{generate_data_raw, Generator, Message};
use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::ops::{Deref, DerefMut};
use tracing::warn;

const MAX_SEGMENT_ATTEMPTS: usize = 3;

const WEIGHT_COLORS: [&str; 5] = [
    "\x1b[48;5;17m",
    "\x1b[48;5;18m",
    "\x1b[48;5;19m",
    "\x1b[48;5;20m",
    "\x1b[48;5;21m",
];
const RESET_COLOR: &str = "\x1b[0m";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    /// Sentence text including its closing punctuation
    pub content: String,
    /// Separator up to the next sentence
    #[serde(default)]
    pub suffix: String,
}

impl Sentence {
    pub fn new(content: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            suffix: suffix.into(),
        }
    }

    /// Section markers such as `###Tips###` are structure, not instructions.
    pub fn is_section_marker(&self) -> bool {
        let content = self.content.as_str();
        content.starts_with("###") && content.ends_with("###")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedSentence {
    #[serde(flatten)]
    pub sentence: Sentence,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub ignore: bool,
}

impl WeightedSentence {
    /// Weight 1 for ordinary sentences, ignored for section markers
    pub fn from_sentence(sentence: Sentence) -> Self {
        if sentence.is_section_marker() {
            Self {
                sentence,
                weight: 0.0,
                ignore: true,
            }
        } else {
            Self {
                sentence,
                weight: 1.0,
                ignore: false,
            }
        }
    }

    pub fn content(&self) -> &str {
        &self.sentence.content
    }
}

/// A candidate prompt split into weighted sentences.
///
/// `Clone` is a deep copy; accepted history and rejected candidates never
/// share storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptSentences(Vec<WeightedSentence>);

impl PromptSentences {
    pub fn new(sentences: Vec<WeightedSentence>) -> Self {
        Self(sentences)
    }

    pub fn from_sentences(sentences: Vec<Sentence>) -> Self {
        Self(
            sentences
                .into_iter()
                .map(WeightedSentence::from_sentence)
                .collect(),
        )
    }

    pub fn into_inner(self) -> Vec<WeightedSentence> {
        self.0
    }

    /// Copy of this prompt with sentence `index` rewritten
    pub fn with_content(&self, index: usize, content: impl Into<String>) -> Self {
        let mut copy = self.clone();
        if let Some(s) = copy.0.get_mut(index) {
            s.sentence.content = content.into();
        }
        copy
    }

    pub fn weights(&self) -> Vec<f64> {
        self.0.iter().map(|s| s.weight).collect()
    }

    pub fn sampleable_count(&self) -> usize {
        self.0.iter().filter(|s| !s.ignore).count()
    }

    /// Softmax of weights over non-ignored sentences; ignored entries are 0.
    pub fn sample_probability(&self) -> Vec<f64> {
        let max_weight = self
            .0
            .iter()
            .filter(|s| !s.ignore)
            .map(|s| s.weight)
            .fold(f64::NEG_INFINITY, f64::max);

        if max_weight == f64::NEG_INFINITY {
            return vec![0.0; self.0.len()];
        }

        let exps: Vec<f64> = self
            .0
            .iter()
            .map(|s| if s.ignore { 0.0 } else { (s.weight - max_weight).exp() })
            .collect();
        let total: f64 = exps.iter().sum();

        exps.into_iter().map(|e| e / total).collect()
    }

    /// Pick a sentence index by weighted sampling.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        let probabilities = self.sample_probability();
        draw(&probabilities, rng)
    }

    /// Pick a sentence other than `exclude`, unless it is the only candidate.
    pub fn sample_excluding<R: Rng + ?Sized>(&self, rng: &mut R, exclude: usize) -> Option<usize> {
        let mut probabilities = self.sample_probability();
        let others = probabilities
            .iter()
            .enumerate()
            .any(|(i, p)| i != exclude && *p > 0.0);
        if !others {
            return self.sample(rng);
        }

        if let Some(p) = probabilities.get_mut(exclude) {
            *p = 0.0;
        }
        let total: f64 = probabilities.iter().sum();
        for p in probabilities.iter_mut() {
            *p /= total;
        }

        draw(&probabilities, rng)
    }

    /// Multiplicative weight update.
    ///
    /// `w_i <- w_i * exp(lr * mixed / (p_i * n))` with `p_i` the current
    /// sampling probability and `n` the sentence count. Ignored sentences keep
    /// their weight.
    pub fn update_weight(&mut self, mixed_eval_result: f64, learning_rate: f64) {
        let probabilities = self.sample_probability();
        let n = self.0.len() as f64;

        for (s, p) in self.0.iter_mut().zip(probabilities) {
            if s.ignore || p <= 0.0 {
                continue;
            }
            s.weight *= (learning_rate * mixed_eval_result / (p * n)).exp();
        }
    }

    /// Render with an ANSI background color per sentence, darker for
    /// sentences that are less likely to be sampled.
    pub fn with_weight_colors(&self) -> String {
        let probabilities = self.sample_probability();

        let mut min_p = 0.0_f64;
        let mut max_p = 0.0_f64;
        for p in &probabilities {
            min_p = min_p.min(*p);
            max_p = max_p.max(*p);
        }
        let step = (max_p - min_p) / WEIGHT_COLORS.len() as f64;

        let mut out = String::new();
        for (s, p) in self.0.iter().zip(probabilities) {
            let color_i = if step > 0.0 {
                (((p - min_p) / step) as usize).min(WEIGHT_COLORS.len() - 1)
            } else {
                0
            };

            out.push_str(WEIGHT_COLORS[color_i]);
            out.push_str(&s.sentence.content);
            out.push_str(RESET_COLOR);
            out.push_str(&s.sentence.suffix);
        }
        out
    }
}

fn draw<R: Rng + ?Sized>(probabilities: &[f64], rng: &mut R) -> Option<usize> {
    let last = probabilities.iter().rposition(|p| *p > 0.0)?;

    let r: f64 = rng.gen();
    let mut cumulative = 0.0;
    for (i, p) in probabilities.iter().enumerate() {
        if *p <= 0.0 {
            continue;
        }
        cumulative += p;
        if r < cumulative {
            return Some(i);
        }
    }

    // Rounding left the walk short of the draw.
    Some(last)
}

impl fmt::Display for PromptSentences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.0 {
            f.write_str(&s.sentence.content)?;
            f.write_str(&s.sentence.suffix)?;
        }
        Ok(())
    }
}

impl Deref for PromptSentences {
    type Target = [WeightedSentence];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PromptSentences {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<WeightedSentence>> for PromptSentences {
    fn from(sentences: Vec<WeightedSentence>) -> Self {
        Self(sentences)
    }
}

//
// ================= Segmentation =================
//

#[derive(Debug, Deserialize)]
struct SegmentOutput {
    sentences: Vec<Sentence>,
}

fn segment_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "sentences": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "content": { "type": "string" },
                        "suffix": { "type": "string" }
                    },
                    "required": ["content", "suffix"]
                }
            }
        },
        "required": ["sentences"]
    })
}

pub fn segment_prompt(content: &str) -> String {
    format!(
        r#"Split the following content into sentences and output the list of sentences. Every item has:
- content: the sentence, including its closing punctuation
- suffix: optional separator. Anything between this sentence and the next one belongs to the suffix, including newlines and spaces.

Notes:
- Joining every content and suffix of the list end to end must reproduce the input exactly.
- Every item holds at least one sentence.

Input:
```
{}
```
"#,
        content
    )
}

fn joined(sentences: &[Sentence]) -> String {
    sentences
        .iter()
        .map(|s| format!("{}{}", s.content, s.suffix))
        .collect()
}

/// Split `content` into sentences with the generator.
///
/// The result must join back to `content`; a mismatch is sent back to the
/// model as a correction, up to `MAX_SEGMENT_ATTEMPTS` attempts.
pub async fn segment(
    generator: &dyn Generator,
    ctx: &RunContext,
    content: &str,
) -> Result<Vec<Sentence>> {
    if content.is_empty() {
        return Ok(Vec::new());
    }

    let prompt = segment_prompt(content);
    ctx.emit(Role::User, prompt.clone());
    let mut messages = vec![Message::user(prompt)];
    let mut last_error = String::new();

    for attempt in 0..MAX_SEGMENT_ATTEMPTS {
        let (raw, decoded) =
            generate_data_raw::<SegmentOutput>(generator, ctx, messages.clone(), segment_schema())
                .await?;

        let problem = match decoded {
            Ok(out) if joined(&out.sentences) == content => return Ok(out.sentences),
            Ok(out) => format!(
                "joining the sentences does not reproduce the input: got {:?}, expected {:?}",
                joined(&out.sentences),
                content
            ),
            Err(e) => e.to_string(),
        };

        warn!(attempt, error = %problem, "Segmentation output rejected");

        let fix = format!(
            "The output is wrong. Fix it according to the error and output again: {}",
            problem
        );
        ctx.emit(Role::User, fix.clone());
        messages.push(Message::model(raw));
        messages.push(Message::user(fix));
        last_error = problem;
    }

    Err(ApoError::StructuredDecodeError(format!(
        "segmentation failed after {} attempts: {}",
        MAX_SEGMENT_ATTEMPTS, last_error
    )))
}
