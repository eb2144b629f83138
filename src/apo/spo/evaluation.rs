//! Pairwise judging of two answers

use crate::context::{Role, RunContext};
use crate::error::ApoError;
use crate::generation::{generate_data_raw, Generator, Message};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

pub const MAX_JUDGE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Choice {
    A,
    B,
}

impl Choice {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "A" => Some(Choice::A),
            "B" => Some(Choice::B),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JudgeOutput {
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    choose: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub analysis: String,
    pub choice: Choice,
}

pub fn judge_prompt(requirements: &str, answer_a: &str, answer_b: &str) -> String {
    let mut out = String::from(
        "Based on the original requirements, evaluate the two responses, A and B, and determine which one better meets the requirements. If a reference requirement is provided, strictly follow the format/content of the reference requirement.\n",
    );

    if !requirements.is_empty() {
        out.push_str(&format!("# Requirement\n```\n{}\n```\n", requirements));
    }

    out.push_str(&format!(
        r#"
# A
```
{}
```

# B
```
{}
```

Provide your analysis and the choice you believe is better, using JSON to encapsulate your response.

```json
{{
  "analysis": "Some analysis",
  "choose": "A/B (the better answer in your opinion)"
}}
```
"#,
        answer_a, answer_b
    ));
    out
}

fn verdict_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "analysis": { "type": "string" },
            "choose": { "type": "string", "enum": ["A", "B"] }
        },
        "required": ["analysis", "choose"]
    })
}

/// Ask which answer better meets the requirements. Undecodable replies and
/// choices other than "A"/"B" are asked again.
pub async fn judge(
    generator: &dyn Generator,
    ctx: &RunContext,
    requirements: &str,
    answer_a: &str,
    answer_b: &str,
) -> Result<Verdict> {
    ctx.emit(Role::User, "Compare answers ...");

    let messages = vec![Message::user(judge_prompt(requirements, answer_a, answer_b))];
    let mut last_error = String::new();

    for attempt in 0..MAX_JUDGE_ATTEMPTS {
        let (_, decoded) =
            generate_data_raw::<JudgeOutput>(generator, ctx, messages.clone(), verdict_schema())
                .await?;

        match decoded {
            Ok(out) => match Choice::parse(&out.choose) {
                Some(choice) => {
                    return Ok(Verdict {
                        analysis: out.analysis,
                        choice,
                    })
                }
                None => {
                    warn!(attempt, choice = %out.choose, "Invalid evaluation result");
                    last_error = format!("invalid choice {:?}", out.choose);
                }
            },
            Err(e) => {
                warn!(attempt, error = %e, "Generate evaluation result error");
                last_error = e.to_string();
            }
        }
    }

    Err(ApoError::StructuredDecodeError(format!(
        "judge gave no valid choice after {} attempts: {}",
        MAX_JUDGE_ATTEMPTS, last_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::MockGenerator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_prompt_labels_answers() {
        let prompt = judge_prompt("", "first", "second");
        assert!(!prompt.contains("# Requirement"));
        assert!(prompt.contains("# A\n```\nfirst\n```\n\n# B\n```\nsecond\n```"));
        assert!(prompt.contains("\"choose\": \"A/B"));

        let prompt = judge_prompt("Short answers.", "a", "b");
        assert!(prompt.contains("# Requirement\n```\nShort answers.\n```\n"));
    }

    #[tokio::test]
    async fn test_choice_is_trimmed() {
        let generator =
            MockGenerator::new(|_| Ok(r#"{"analysis": "B is clearer", "choose": " B\n"}"#.to_string()));

        let verdict = judge(&generator, &RunContext::new(), "", "a", "b").await.unwrap();

        assert_eq!(verdict.choice, Choice::B);
        assert_eq!(verdict.analysis, "B is clearer");
    }

    #[tokio::test]
    async fn test_invalid_choice_is_retried() {
        let calls = AtomicUsize::new(0);
        let generator = MockGenerator::new(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(r#"{"analysis": "both fine", "choose": "C"}"#.to_string())
            } else {
                Ok(r#"{"analysis": "A wins", "choose": "A"}"#.to_string())
            }
        });

        let verdict = judge(&generator, &RunContext::new(), "", "a", "b").await.unwrap();

        assert_eq!(verdict.choice, Choice::A);
        assert_eq!(generator.call_count(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_attempts() {
        let generator = MockGenerator::new(|_| Ok("not json".to_string()));

        let err = judge(&generator, &RunContext::new(), "", "a", "b").await.unwrap_err();

        assert!(err.is_decode_error());
        assert_eq!(generator.call_count(), MAX_JUDGE_ATTEMPTS);
    }
}
