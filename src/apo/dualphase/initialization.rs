//! P0 synthesis from few-shot examples

use crate::context::{Role, RunContext};
use crate::error::ApoError;
use crate::generation::{generate_data, generate_text, Generator, Message};
use crate::models::InputOutputPair;
use crate::Result;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Meta-prompt asking the model to infer the instruction behind the pairs
pub fn initialization_prompt(training_data: &[InputOutputPair], in_chinese: bool) -> String {
    let mut pairs = String::new();
    for pair in training_data {
        pairs.push_str(&format!("Input: {}\nOutput: {}\n\n", pair.input, pair.output));
    }

    format!(
        r#"You gave me an instruction on a certain task and some example inputs with chain-of-thought. I read the instruction carefully and wrote an output with chain-of-thought for every input correctly. Here are some correct input-output pairs which strictly meet all your requirements:

###Input-Output Pairs###
{}The instruction given contains the following parts. Based on the input-output pairs provided, give me the final complete instruction in {} without any explanation:

###Task type###
Task type: This is a <...> task.

###Task detailed description###
Task detailed description: <Task detailed description>

###Your output must satisfy the following format and constraints###
Output format(type): <Output format or its type>
Output constraints: <constraints on output>

###You must follow the reasoning process###
<add several reasoning steps if it's necessary>

###Tips###
<add several useful tips from a professional point of view to accomplish this task better>
"#,
        pairs,
        if in_chinese { "Chinese" } else { "English" }
    )
}

/// Ask the generator for P0. A previous draft is sent as an earlier model
/// turn so the new instruction continues from it.
pub async fn synthesize_p0(
    generator: &dyn Generator,
    ctx: &RunContext,
    previous_p0: &str,
    training_data: &[InputOutputPair],
    in_chinese: bool,
) -> Result<String> {
    let prompt = initialization_prompt(training_data, in_chinese);

    let mut messages = Vec::with_capacity(2);
    if !previous_p0.is_empty() {
        ctx.emit(Role::Model, previous_p0);
        messages.push(Message::model(previous_p0));
    }
    ctx.emit(Role::User, prompt.clone());
    messages.push(Message::user(prompt));

    generate_text(generator, ctx, messages).await
}

/// Ask for `count` example pairs that an earlier prompt draft would answer
pub fn training_pairs_prompt(previous_p0: &str, count: usize) -> String {
    format!(
        r#"Here is an instruction for a certain task:

###Instruction###
```
{}
```

Write {} different example inputs this instruction is meant to handle, each with the output that strictly meets all of its requirements. Cover different cases of the task. Reply in JSON:

```json
{{"pairs": [{{"input": "<example input>", "output": "<expected output>"}}]}}
```
"#,
        previous_p0, count
    )
}

fn training_pairs_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "pairs": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "input": { "type": "string" },
                        "output": { "type": "string" }
                    },
                    "required": ["input", "output"]
                }
            }
        },
        "required": ["pairs"]
    })
}

#[derive(Deserialize)]
struct TrainingPairs {
    #[serde(default)]
    pairs: Vec<InputOutputPair>,
}

/// Generate up to `count` input-output pairs from an earlier draft.
/// Extra pairs are dropped; a reply with none is an error.
pub async fn generate_training_pairs(
    generator: &dyn Generator,
    ctx: &RunContext,
    previous_p0: &str,
    count: usize,
) -> Result<Vec<InputOutputPair>> {
    if count == 0 || previous_p0.trim().is_empty() {
        return Ok(Vec::new());
    }

    ctx.emit(Role::User, format!("Generate {} training pairs ...", count));

    let decoded = generate_data::<TrainingPairs>(
        generator,
        ctx,
        vec![Message::user(training_pairs_prompt(previous_p0, count))],
        training_pairs_schema(),
    )
    .await?;

    let mut pairs = decoded.value.pairs;
    if pairs.is_empty() {
        return Err(ApoError::StructuredDecodeError(format!(
            "no training pairs in response: {}",
            decoded.raw
        )));
    }
    pairs.truncate(count);

    info!(pairs = pairs.len(), "Generated training pairs");
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::MockGenerator;

    #[test]
    fn test_prompt_lists_pairs() {
        let prompt = initialization_prompt(&[InputOutputPair::new("input1", "output1")], false);
        assert!(prompt.contains(
            "###Input-Output Pairs###\nInput: input1\nOutput: output1\n\nThe instruction given contains the following parts."
        ));
        assert!(prompt.contains("complete instruction in English"));

        let prompt = initialization_prompt(&[], true);
        assert!(prompt.contains("###Input-Output Pairs###\nThe instruction given contains the following parts."));
        assert!(prompt.contains("complete instruction in Chinese"));

        let prompt = initialization_prompt(
            &[
                InputOutputPair::new("input1", "output1"),
                InputOutputPair::new("input2", "output2"),
            ],
            false,
        );
        assert!(prompt.contains("Input: input1\nOutput: output1\n\nInput: input2\nOutput: output2\n\n"));
    }

    #[tokio::test]
    async fn test_training_pairs_are_generated_and_capped() {
        let generator = MockGenerator::new(|_| {
            Ok(r#"{"pairs": [
                {"input": "1+1", "output": "2"},
                {"input": "2+3", "output": "5"},
                {"input": "4+4", "output": "8"}
            ]}"#
            .to_string())
        });

        let pairs = generate_training_pairs(&generator, &RunContext::new(), "Answer sums.", 2)
            .await
            .unwrap();

        assert_eq!(
            pairs,
            vec![InputOutputPair::new("1+1", "2"), InputOutputPair::new("2+3", "5")]
        );
        let request = &generator.requests()[0];
        assert!(request.structured);
        assert!(request.messages[0].text.contains("```\nAnswer sums.\n```"));
        assert!(request.messages[0].text.contains("Write 2 different example inputs"));
    }

    #[tokio::test]
    async fn test_no_training_pairs_without_draft_or_count() {
        let generator = MockGenerator::new(|_| Ok("{}".to_string()));
        let ctx = RunContext::new();

        assert!(generate_training_pairs(&generator, &ctx, "Answer sums.", 0)
            .await
            .unwrap()
            .is_empty());
        assert!(generate_training_pairs(&generator, &ctx, "  ", 3)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_pair_list_is_a_decode_error() {
        let generator = MockGenerator::new(|_| Ok(r#"{"pairs": []}"#.to_string()));

        let err = generate_training_pairs(&generator, &RunContext::new(), "Answer sums.", 3)
            .await
            .unwrap_err();

        assert!(err.is_decode_error());
    }

    #[tokio::test]
    async fn test_previous_draft_goes_first() {
        let generator = MockGenerator::new(|_| Ok("###Task type###\nAdd numbers.".to_string()));

        let p0 = synthesize_p0(
            &generator,
            &RunContext::new(),
            "old draft",
            &[InputOutputPair::new("1+1", "2")],
            false,
        )
        .await
        .unwrap();

        assert_eq!(p0, "###Task type###\nAdd numbers.");
        let request = &generator.requests()[0];
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0], Message::model("old draft"));
        assert_eq!(request.messages[1].role, Role::User);
    }
}
