//! Answering evaluation questions with a candidate prompt

use crate::context::{Role, RunContext};
use crate::generation::{generate_text, Generator, Message};
use crate::Result;

pub fn execution_prompt(prompt: &str, question: &str) -> String {
    format!(
        "Answer the question according to the instruction.\n\n## Instruction\n```\n{}\n```\n\n## Question\n```\n{}\n```\n",
        prompt, question
    )
}

/// One generation per question, answers kept in question order.
pub async fn execute(
    generator: &dyn Generator,
    ctx: &RunContext,
    prompt: &str,
    questions: &[String],
) -> Result<Vec<String>> {
    let mut answers = Vec::with_capacity(questions.len());

    for (i, question) in questions.iter().enumerate() {
        ctx.emit(Role::User, format!("Answer question {} ...", i + 1));
        let answer = generate_text(
            generator,
            ctx,
            vec![Message::user(execution_prompt(prompt, question))],
        )
        .await?;
        answers.push(answer);
    }

    Ok(answers)
}
