//! Batch evaluation of a prompt against input/output pairs
//!
//! Correctness is exact string equality with the expected output.

use crate::context::{Role, RunContext};
use crate::error::ApoError;
use crate::generation::{generate_data_raw, Generator, Message};
use crate::models::{EvaluationReport, FailedCase, InputOutputPair};
use crate::Result;
use serde_json::json;
use tracing::warn;

/// Attempts per batch, corrective retries included
pub const MAX_EVALUATION_ATTEMPTS: usize = 3;

pub fn batch_evaluation_prompt(prompt: &str, batch: &[InputOutputPair]) -> String {
    let mut out = format!(
        r#"Follow the instruction below and give the correct output for every input.

###Instruction###
```
{}
```

###Output format###
Output a JSON list of strings. Each item is one output, in the same order as the inputs.

###Inputs###"#,
        prompt
    );

    for (i, item) in batch.iter().enumerate() {
        out.push_str(&format!("\ninput {}:\n```\n{}\n```\n", i, item.input));
    }
    out
}

fn outputs_schema() -> serde_json::Value {
    json!({
        "type": "array",
        "items": { "type": "string" }
    })
}

/// Evaluate one batch. The model must return exactly one output per input;
/// decode failures and count mismatches are fed back as corrections.
pub async fn evaluate_batch(
    generator: &dyn Generator,
    ctx: &RunContext,
    prompt: &str,
    batch: &[InputOutputPair],
) -> Result<EvaluationReport> {
    ctx.emit(Role::User, "Write outputs for inputs ...");

    let mut messages = vec![Message::user(batch_evaluation_prompt(prompt, batch))];
    let mut outputs = None;
    let mut last_error = String::new();

    for attempt in 0..MAX_EVALUATION_ATTEMPTS {
        let (raw, decoded) =
            generate_data_raw::<Vec<String>>(generator, ctx, messages.clone(), outputs_schema())
                .await?;

        let problem = match decoded {
            Ok(items) if items.len() == batch.len() => {
                outputs = Some(items);
                break;
            }
            Ok(items) => format!(
                "the number of output items does not match the number of input items, output: {} (expected {})",
                items.len(),
                batch.len()
            ),
            Err(e) => e.to_string(),
        };

        warn!(attempt, error = %problem, "Generate evaluation output error");

        let fix = format!(
            "The output is wrong. Fix it according to the error and output again: {}",
            problem
        );
        ctx.emit(Role::User, fix.clone());
        messages.push(Message::model(raw));
        messages.push(Message::user(fix));
        last_error = problem;
    }

    let outputs = outputs.ok_or_else(|| {
        ApoError::StructuredDecodeError(format!(
            "evaluation output rejected after {} attempts: {}",
            MAX_EVALUATION_ATTEMPTS, last_error
        ))
    })?;

    let mut report = EvaluationReport {
        batches: 1,
        ..Default::default()
    };

    for (item, actual) in batch.iter().zip(outputs) {
        if actual == item.output {
            report.correct += 1;
        } else {
            report.wrong += 1;
            report.failed_cases.push(FailedCase {
                input: item.input.clone(),
                expected: item.output.clone(),
                actual,
            });
        }
    }

    Ok(report)
}

/// Evaluate `data` in batches of `batch_size` (already shuffled by the caller).
pub async fn evaluate_pairs(
    generator: &dyn Generator,
    ctx: &RunContext,
    prompt: &str,
    data: &[InputOutputPair],
    batch_size: usize,
) -> Result<EvaluationReport> {
    if data.is_empty() {
        return Err(ApoError::NoValidationData);
    }

    let mut report = EvaluationReport::default();
    for batch in data.chunks(batch_size.max(1)) {
        report.merge(evaluate_batch(generator, ctx, prompt, batch).await?);
    }

    Ok(report)
}

/// Inputs of a batch evaluation prompt, in order. Used by test doubles.
#[cfg(test)]
pub(crate) fn parse_batch_inputs(prompt: &str) -> Vec<String> {
    let Some((_, inputs)) = prompt.split_once("###Inputs###") else {
        return Vec::new();
    };

    inputs
        .split("\ninput ")
        .skip(1)
        .filter_map(|block| {
            let start = block.find("```\n")? + 4;
            let end = block[start..].find("\n```")? + start;
            Some(block[start..end].to_string())
        })
        .collect()
}
