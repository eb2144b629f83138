//! Plain-text and markdown rendering of optimizer progress

use crate::apo::dualphase::DualPhaseRound;
use crate::apo::sentence::PromptSentences;
use crate::apo::spo::{Judgement, SpoRound, SpoSnapshot, Winner};
use crate::apo::RoundOutcome;
use crate::context::{Role, StreamChunk};

const RULE_WIDTH: usize = 50;

fn quote(text: &str) -> String {
    text.trim().replace('\n', "\n> ")
}

// ================= SPO =================

/// `### P{i}` heading with an optional tag, then the prompt
pub fn spo_prompt(index: usize, tag: Option<&str>, content: &str) -> String {
    let mut title = format!("### P{}", index);
    if let Some(tag) = tag {
        title.push_str(&format!(" ({})", tag));
    }
    format!("{}\n\n{}\n\n", title, content.trim())
}

fn answer(index: usize, text: &str) -> String {
    format!("#### Answer {}\n\n{}\n\n", index, text.trim())
}

pub fn spo_initial(snapshot: &SpoSnapshot) -> String {
    let mut out = spo_prompt(0, None, &snapshot.prompt);
    for (i, text) in snapshot.answers.iter().enumerate() {
        out.push_str(&answer(i + 1, text));
    }
    out
}

pub fn judgement(j: &Judgement) -> String {
    let name_line = if j.new_is_a {
        "**A -> New** | B -> Current"
    } else {
        "A -> Current | **B -> New**"
    };
    let better = match j.winner {
        Winner::New => "New",
        Winner::Current => "Current",
    };

    format!(
        "---\n\n{}\n\n> {}\n\nBetter: {}\n\n",
        name_line,
        quote(&j.analysis),
        better
    )
}

pub fn evaluation_summary(old_better: usize, new_better: usize) -> String {
    let better = if new_better > old_better { "New" } else { "Current" };
    format!(
        "#### Evaluation Summary\n\n**Final Result: {}:{} ({} Better)**\n\n",
        old_better, new_better, better
    )
}

/// Full markdown for one SPO round: draft, answers, judgements, summary and
/// the accepted prompt when there is one.
pub fn spo_round(round: &SpoRound) -> String {
    let mut out = format!(
        "### P{} (Draft{})\n\n> {}\n\n{}\n\n",
        round.prompt_index,
        round.draft_index,
        quote(&round.analysis),
        round.prompt.trim()
    );

    for (i, text) in round.answers.iter().enumerate() {
        out.push_str(&answer(i + 1, text));
        out.push_str("#### Evaluation\n\n");
        for j in round.judgements.iter().filter(|j| j.question_index == i) {
            out.push_str(&judgement(j));
        }
    }

    out.push_str(&evaluation_summary(round.old_better, round.new_better));

    if round.accepted {
        out.push_str(&spo_prompt(round.prompt_index, Some("Accepted"), &round.prompt));
    }
    out
}

// ================= Dual-phase =================

fn rule(label: &str) -> String {
    format!("{:-^width$}", format!(" {} ", label), width = RULE_WIDTH)
}

/// Accuracy line and weight heatmap between two rules
pub fn dual_phase_prompt(label: &str, accuracy: f64, prompt: &PromptSentences) -> String {
    format!(
        "{}\nAccuracy: {:.4}\n{}\n{}\n",
        rule(label),
        accuracy,
        prompt.with_weight_colors(),
        "-".repeat(RULE_WIDTH)
    )
}

/// `prompt_index` counts accepted prompts so far, this round included
pub fn dual_phase_round(round_number: usize, prompt_index: usize, round: &DualPhaseRound) -> String {
    match round.outcome {
        RoundOutcome::Accepted => {
            let label = format!("P{}", prompt_index);
            dual_phase_prompt(&label, round.accuracy, &round.prompt)
        }
        RoundOutcome::Optimal => format!(
            "Round {}: no failed cases left, accuracy {:.4}\n",
            round_number, round.accuracy
        ),
        RoundOutcome::Exhausted | RoundOutcome::Rejected => format!(
            "Round {}: no improvement after {} attempts, accuracy {:.4}\n",
            round_number, round.attempts, round.accuracy
        ),
    }
}

// ================= Stream =================

/// Terminal rendering of a stream chunk: user notes green, system blue,
/// model text as is.
pub fn stream_chunk(chunk: &StreamChunk) -> String {
    match chunk.role {
        Role::System => format!("\x1b[34m  {}\x1b[0m\n", chunk.text.replace('\n', "\n  ")),
        Role::User => format!("\x1b[32m  {}\x1b[0m\n", chunk.text.replace('\n', "\n  ")),
        Role::Model => format!("{}\n", chunk.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apo::spo::Choice;

    fn judged(question_index: usize, new_is_a: bool, winner: Winner) -> Judgement {
        Judgement {
            question_index,
            new_is_a,
            analysis: "line one\nline two".to_string(),
            choice: if new_is_a == (winner == Winner::New) { Choice::A } else { Choice::B },
            winner,
        }
    }

    #[test]
    fn test_prompt_heading() {
        assert_eq!(spo_prompt(0, None, " Answer. \n"), "### P0\n\nAnswer.\n\n");
        assert_eq!(
            spo_prompt(2, Some("Accepted"), "Answer."),
            "### P2 (Accepted)\n\nAnswer.\n\n"
        );
    }

    #[test]
    fn test_judgement_block() {
        assert_eq!(
            judgement(&judged(0, true, Winner::New)),
            "---\n\n**A -> New** | B -> Current\n\n> line one\n> line two\n\nBetter: New\n\n"
        );
        assert!(judgement(&judged(0, false, Winner::Current))
            .starts_with("---\n\nA -> Current | **B -> New**\n\n"));
    }

    #[test]
    fn test_summary_line() {
        assert_eq!(
            evaluation_summary(3, 5),
            "#### Evaluation Summary\n\n**Final Result: 3:5 (New Better)**\n\n"
        );
        assert!(evaluation_summary(4, 4).contains("**Final Result: 4:4 (Current Better)**"));
    }

    #[test]
    fn test_spo_round_layout() {
        let round = SpoRound {
            prompt: "Answer with evidence.".to_string(),
            accepted: true,
            old_better: 1,
            new_better: 3,
            analysis: "lacks sources".to_string(),
            modification: "ask for evidence".to_string(),
            answers: vec!["new answer".to_string()],
            judgements: vec![
                judged(0, true, Winner::New),
                judged(0, false, Winner::New),
                judged(0, true, Winner::Current),
                judged(0, false, Winner::New),
            ],
            prompt_index: 1,
            draft_index: 2,
        };

        let out = spo_round(&round);

        assert!(out.starts_with("### P1 (Draft2)\n\n> lacks sources\n\nAnswer with evidence.\n\n#### Answer 1\n\nnew answer\n\n#### Evaluation\n\n---"));
        assert_eq!(out.matches("---\n\n").count(), 4);
        assert!(out.contains("**Final Result: 1:3 (New Better)**"));
        assert!(out.ends_with("### P1 (Accepted)\n\nAnswer with evidence.\n\n"));
    }

    #[test]
    fn test_dual_phase_prompt_block() {
        let prompt = PromptSentences::from_sentences(vec![crate::apo::sentence::Sentence::new(
            "Add.", "",
        )]);
        let out = dual_phase_prompt("P0", 0.5, &prompt);

        assert!(out.starts_with("----------------------- P0 -----------------------\nAccuracy: 0.5000\n"));
        assert!(out.contains("Add.\x1b[0m"));
    }

    #[test]
    fn test_stream_chunk_colors() {
        let user = StreamChunk {
            role: Role::User,
            text: "Optimize\nnow".to_string(),
        };
        assert_eq!(stream_chunk(&user), "\x1b[32m  Optimize\n  now\x1b[0m\n");

        let model = StreamChunk {
            role: Role::Model,
            text: "ok".to_string(),
        };
        assert_eq!(stream_chunk(&model), "ok\n");
    }
}
