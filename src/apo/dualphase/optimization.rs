//! Sentence rewrite request

use crate::context::{Role, RunContext};
use crate::generation::{generate_text, Generator, Message};
use crate::models::FailedCase;
use crate::Result;

pub fn optimization_prompt(prompt: &str, sentence: &str, failed_cases: &[FailedCase]) -> String {
    let mut cases = String::new();
    for case in failed_cases {
        cases.push_str(&format!(
            "Input: {}\nOutput: {}\nExpected: {}\n\n",
            case.input, case.actual, case.expected
        ));
    }

    format!(
        r#"I'm trying to write a zero-shot prompt which consists of four parts.
My current prompt is:
```
{prompt}
```

But it gets the following outputs that fail to match the expected outputs:
{cases}The sentence I want to revise is:
`{sentence}`

Comparing the wrong outputs with their corresponding expected answers under the same input, optimize the above sentence to help AI understand the task more comprehensively and accomplish this task better.
Your response is the sentence `{sentence}` should be revised to, without any explanation.
"#
    )
}

/// Ask for a rewrite of `sentence`; the reply is trimmed.
pub async fn rewrite_sentence(
    generator: &dyn Generator,
    ctx: &RunContext,
    prompt: &str,
    sentence: &str,
    failed_cases: &[FailedCase],
) -> Result<String> {
    ctx.emit(Role::User, format!("Optimize sentence {:?} ...", sentence));

    let text = generate_text(
        generator,
        ctx,
        vec![Message::user(optimization_prompt(prompt, sentence, failed_cases))],
    )
    .await?;

    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_shows_failures() {
        let prompt = optimization_prompt(
            "Add the numbers.",
            "Add the numbers.",
            &[FailedCase {
                input: "3+3".to_string(),
                expected: "7".to_string(),
                actual: "6".to_string(),
            }],
        );

        assert!(prompt.contains("```\nAdd the numbers.\n```"));
        assert!(prompt.contains("Input: 3+3\nOutput: 6\nExpected: 7\n\nThe sentence I want to revise is:\n`Add the numbers.`"));
    }
}
