//! Whole-prompt rewrite request

use crate::context::{Role, RunContext};
use crate::generation::{generate_data, Generator, Message};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Rewrite proposed by the model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Drawbacks of the current answers
    #[serde(default)]
    pub analysis: String,
    /// One-line summary of the change
    #[serde(default)]
    pub modification: String,
    pub prompt: String,
}

pub fn optimization_prompt(requirements: &str, prompt: &str, answers: &[String]) -> String {
    let mut out = String::from(
        "You are building a prompt to address user requirement.Based on the given prompt, please reconstruct and optimize it. You can add, modify, or delete prompts. Please include a single modification in XML tags in your reply. During the optimization, you can incorporate any thinking models.\n\
This is a prompt that performed excellently in a previous iteration. You must make further optimizations and improvements based on this prompt. The modified prompt must differ from the provided example.\n",
    );

    if !requirements.is_empty() {
        out.push_str(&format!("requirements:\n```\n{}\n```\n", requirements));
    }

    out.push_str(&format!(
        "\nreference prompt:\n```\n{}\n```\n\nThe execution result of this reference prompt is(some cases):\n",
        prompt
    ));
    for answer in answers {
        out.push_str(&format!("```\n{}\n```\n\n", answer));
    }

    out.push_str(
        r#"
Provide your analysis, optimization points, and the complete optimized prompt using the following JSON format:

```json
{
  "analysis": "Analyze what drawbacks exist in the results produced by the reference prompt and how to improve them.",
  "modification": "Summarize the key points for improvement in one sentence",
  "prompt": "Provide the complete optimized prompt"
}
```
"#,
    );
    out
}

fn proposal_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "analysis": { "type": "string" },
            "modification": { "type": "string" },
            "prompt": { "type": "string" }
        },
        "required": ["analysis", "modification", "prompt"]
    })
}

pub async fn propose(
    generator: &dyn Generator,
    ctx: &RunContext,
    requirements: &str,
    prompt: &str,
    answers: &[String],
) -> Result<Proposal> {
    ctx.emit(Role::User, "Optimize prompt ...");

    let decoded = generate_data::<Proposal>(
        generator,
        ctx,
        vec![Message::user(optimization_prompt(requirements, prompt, answers))],
        proposal_schema(),
    )
    .await?;

    Ok(decoded.value)
}
