//! Self-supervised prompt optimizer
//!
//! Each round rewrites the whole prompt, answers every evaluation question with
//! the rewrite, and lets the model judge old against new answers. Every
//! question is judged four times with the A/B labels swapped in alternate
//! rounds so a judge that favors one position cancels out.

use crate::apo::{PromptOptimizer, RoundOutcome, RoundSummary};
use crate::context::RunContext;
use crate::error::ApoError;
use crate::generation::Generator;
use crate::history::PromptHistory;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub mod evaluation;
pub mod execution;
pub mod optimization;

pub use evaluation::{Choice, Verdict};
pub use optimization::Proposal;

/// Judgements per question
pub const JUDGE_ROUNDS: usize = 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpoOptions {
    pub p0: String,
    /// Extra requirements shown to the rewriter and the judge
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requirements: String,
    #[serde(default)]
    pub evaluation_questions: Vec<String>,
    /// Reserved; the SPO round draws no random numbers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoSnapshot {
    pub prompt: String,
    pub answers: Vec<String>,
}

/// Which prompt produced the winning answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    New,
    Current,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgement {
    pub question_index: usize,
    /// The new answer was shown as "A"
    pub new_is_a: bool,
    pub analysis: String,
    pub choice: Choice,
    pub winner: Winner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoRound {
    /// Proposed prompt, accepted or not
    pub prompt: String,
    pub accepted: bool,
    pub old_better: usize,
    pub new_better: usize,
    pub analysis: String,
    pub modification: String,
    /// Answers produced by the proposed prompt
    pub answers: Vec<String>,
    pub judgements: Vec<Judgement>,
    /// Index the proposal would take once accepted
    pub prompt_index: usize,
    /// Rejected proposals since the last accepted prompt, before this one
    pub draft_index: usize,
}

impl RoundSummary for SpoRound {
    fn outcome(&self) -> RoundOutcome {
        if self.accepted {
            RoundOutcome::Accepted
        } else {
            RoundOutcome::Rejected
        }
    }
}

pub struct SpoOptimizer {
    session_id: Uuid,
    opts: SpoOptions,
    generator: Arc<dyn Generator>,
    initialized: bool,
    prompt_index: usize,
    draft_index: usize,
    cur_prompt: String,
    cur_answers: Vec<String>,
    history: PromptHistory,
}

impl SpoOptimizer {
    pub fn new(generator: Arc<dyn Generator>, opts: SpoOptions) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            opts,
            generator,
            initialized: false,
            prompt_index: 0,
            draft_index: 0,
            cur_prompt: String::new(),
            cur_answers: Vec::new(),
            history: PromptHistory::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn options(&self) -> &SpoOptions {
        &self.opts
    }

    pub fn current_prompt(&self) -> &str {
        &self.cur_prompt
    }

    pub fn current_answers(&self) -> &[String] {
        &self.cur_answers
    }

    pub fn prompt_index(&self) -> usize {
        self.prompt_index
    }

    pub fn draft_index(&self) -> usize {
        self.draft_index
    }

    pub fn history(&self) -> &PromptHistory {
        &self.history
    }

    async fn judge_question(
        &self,
        ctx: &RunContext,
        question_index: usize,
        new_answer: &str,
    ) -> Result<Vec<Judgement>> {
        let old_answer = &self.cur_answers[question_index];
        let mut judgements = Vec::with_capacity(JUDGE_ROUNDS);

        for round in 0..JUDGE_ROUNDS {
            let new_is_a = round % 2 == 0;
            let (a, b) = if new_is_a {
                (new_answer, old_answer.as_str())
            } else {
                (old_answer.as_str(), new_answer)
            };

            let verdict =
                evaluation::judge(self.generator.as_ref(), ctx, &self.opts.requirements, a, b).await?;

            let winner = match (verdict.choice, new_is_a) {
                (Choice::A, true) | (Choice::B, false) => Winner::New,
                _ => Winner::Current,
            };
            debug!(question_index, round, ?winner, "Judged answers");

            judgements.push(Judgement {
                question_index,
                new_is_a,
                analysis: verdict.analysis,
                choice: verdict.choice,
                winner,
            });
        }

        Ok(judgements)
    }
}

#[async_trait]
impl PromptOptimizer for SpoOptimizer {
    type Snapshot = SpoSnapshot;
    type Round = SpoRound;

    async fn initialize(&mut self, ctx: &RunContext) -> Result<SpoSnapshot> {
        if self.opts.evaluation_questions.is_empty() {
            return Err(ApoError::NoEvaluationQuestions);
        }
        info!(
            session_id = %self.session_id,
            questions = self.opts.evaluation_questions.len(),
            "Initializing SPO optimizer"
        );

        let answers = execution::execute(
            self.generator.as_ref(),
            ctx,
            &self.opts.p0,
            &self.opts.evaluation_questions,
        )
        .await?;

        self.cur_prompt = self.opts.p0.clone();
        self.cur_answers = answers;
        self.prompt_index = 0;
        self.draft_index = 0;
        self.history = PromptHistory::new();
        self.history.record(self.cur_prompt.clone(), None);
        self.initialized = true;

        Ok(SpoSnapshot {
            prompt: self.cur_prompt.clone(),
            answers: self.cur_answers.clone(),
        })
    }

    async fn optimize(&mut self, ctx: &RunContext) -> Result<SpoRound> {
        if !self.initialized {
            return Err(ApoError::NotInitialized);
        }

        let proposal = optimization::propose(
            self.generator.as_ref(),
            ctx,
            &self.opts.requirements,
            &self.cur_prompt,
            &self.cur_answers,
        )
        .await?;
        debug!(session_id = %self.session_id, modification = %proposal.modification, "Proposed prompt");

        let answers = execution::execute(
            self.generator.as_ref(),
            ctx,
            &proposal.prompt,
            &self.opts.evaluation_questions,
        )
        .await?;

        let mut judgements = Vec::with_capacity(answers.len() * JUDGE_ROUNDS);
        for (i, answer) in answers.iter().enumerate() {
            judgements.extend(self.judge_question(ctx, i, answer).await?);
        }

        let new_better = judgements.iter().filter(|j| j.winner == Winner::New).count();
        let old_better = judgements.len() - new_better;
        let accepted = new_better > old_better;
        info!(
            session_id = %self.session_id,
            old_better,
            new_better,
            accepted,
            "old:new -> {}:{}",
            old_better,
            new_better
        );

        let round = SpoRound {
            prompt: proposal.prompt,
            accepted,
            old_better,
            new_better,
            analysis: proposal.analysis,
            modification: proposal.modification,
            answers,
            judgements,
            prompt_index: self.prompt_index + 1,
            draft_index: self.draft_index,
        };

        if accepted {
            self.cur_prompt = round.prompt.clone();
            self.cur_answers = round.answers.clone();
            self.prompt_index += 1;
            self.draft_index = 0;
            self.history.record(self.cur_prompt.clone(), None);
        } else {
            self.draft_index += 1;
        }

        Ok(round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apo::run_rounds;
    use crate::context::CancelToken;
    use crate::generation::{GenerateRequest, MockGenerator};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NEW_PROMPT: &str = "Answer with evidence.";

    fn options(questions: &[&str]) -> SpoOptions {
        SpoOptions {
            p0: "Answer.".to_string(),
            requirements: "Cite sources.".to_string(),
            evaluation_questions: questions.iter().map(|q| q.to_string()).collect(),
            seed: None,
        }
    }

    fn answer_for(req: &GenerateRequest) -> String {
        if req.first_user_text().contains(NEW_PROMPT) {
            "new answer".to_string()
        } else {
            "old answer".to_string()
        }
    }

    /// Generator whose judge picks by `choose(call, new_is_a)`
    fn spo_generator<F>(choose: F) -> Arc<MockGenerator>
    where
        F: Fn(usize, bool) -> &'static str + Send + Sync + 'static,
    {
        let judged = AtomicUsize::new(0);
        Arc::new(MockGenerator::new(move |req| {
            let text = req.first_user_text();
            if text.contains("reference prompt:") {
                Ok(json!({
                    "analysis": "answers lack sources",
                    "modification": "ask for evidence",
                    "prompt": NEW_PROMPT
                })
                .to_string())
            } else if text.contains("# A\n```\n") {
                let new_is_a = text.contains("# A\n```\nnew answer");
                let call = judged.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"analysis": "compared", "choose": choose(call, new_is_a)}).to_string())
            } else {
                Ok(answer_for(req))
            }
        }))
    }

    #[tokio::test]
    async fn test_initialize_requires_questions() {
        let generator = spo_generator(|_, _| "A");
        let mut optimizer = SpoOptimizer::new(generator.clone(), options(&[]));

        let err = optimizer.initialize(&RunContext::new()).await.unwrap_err();

        assert!(matches!(err, ApoError::NoEvaluationQuestions));
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_answers_each_question() {
        let generator = spo_generator(|_, _| "A");
        let mut optimizer = SpoOptimizer::new(generator, options(&["q1", "q2"]));

        let snapshot = optimizer.initialize(&RunContext::new()).await.unwrap();

        assert_eq!(snapshot.prompt, "Answer.");
        assert_eq!(snapshot.answers, vec!["old answer", "old answer"]);
        assert_eq!(optimizer.history().len(), 1);
    }

    #[tokio::test]
    async fn test_positional_bias_cancels_out() {
        let generator = spo_generator(|_, _| "A");
        let mut optimizer = SpoOptimizer::new(generator, options(&["q1", "q2"]));
        let ctx = RunContext::new();
        optimizer.initialize(&ctx).await.unwrap();

        let round = optimizer.optimize(&ctx).await.unwrap();

        assert_eq!(round.judgements.len(), 8);
        assert_eq!(round.new_better, 4);
        assert_eq!(round.old_better, 4);
        assert!(!round.accepted);
        for question in 0..2 {
            let labels: Vec<bool> = round
                .judgements
                .iter()
                .filter(|j| j.question_index == question)
                .map(|j| j.new_is_a)
                .collect();
            assert_eq!(labels, vec![true, false, true, false]);
        }
        assert_eq!(optimizer.current_prompt(), "Answer.");
        assert_eq!(optimizer.draft_index(), 1);
    }

    #[tokio::test]
    async fn test_majority_for_new_prompt_is_accepted() {
        // New answer wins the first five judgements
        let generator = spo_generator(|call, new_is_a| {
            let pick_new = call < 5;
            if pick_new == new_is_a {
                "A"
            } else {
                "B"
            }
        });
        let mut optimizer = SpoOptimizer::new(generator, options(&["q1", "q2"]));
        let ctx = RunContext::new();
        optimizer.initialize(&ctx).await.unwrap();

        let round = optimizer.optimize(&ctx).await.unwrap();

        assert_eq!((round.old_better, round.new_better), (3, 5));
        assert!(round.accepted);
        assert_eq!(round.outcome(), RoundOutcome::Accepted);
        assert_eq!(round.prompt_index, 1);
        assert_eq!(round.draft_index, 0);
        assert_eq!(optimizer.current_prompt(), NEW_PROMPT);
        assert_eq!(optimizer.current_answers(), ["new answer", "new answer"]);
        assert_eq!(optimizer.prompt_index(), 1);
        assert_eq!(optimizer.history().prompts(), vec!["Answer.", NEW_PROMPT]);
    }

    #[tokio::test]
    async fn test_majority_for_current_prompt_is_rejected() {
        let generator = spo_generator(|call, new_is_a| {
            let pick_new = call < 3;
            if pick_new == new_is_a {
                "A"
            } else {
                "B"
            }
        });
        let mut optimizer = SpoOptimizer::new(generator, options(&["q1", "q2"]));
        let ctx = RunContext::new();
        optimizer.initialize(&ctx).await.unwrap();

        let round = optimizer.optimize(&ctx).await.unwrap();

        assert_eq!((round.old_better, round.new_better), (5, 3));
        assert!(!round.accepted);
        assert_eq!(round.prompt, NEW_PROMPT);
        assert_eq!(optimizer.current_prompt(), "Answer.");
        assert_eq!(optimizer.current_answers(), ["old answer", "old answer"]);
        assert_eq!(optimizer.history().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_rounds_never_stop_the_driver() {
        let generator = spo_generator(|_, _| "A");
        let mut optimizer = SpoOptimizer::new(generator, options(&["q1"]));
        let ctx = RunContext::new();
        optimizer.initialize(&ctx).await.unwrap();

        let mut drafts = Vec::new();
        let rounds = run_rounds(&mut optimizer, &ctx, 3, |_, round: &SpoRound| {
            drafts.push(round.draft_index)
        })
        .await
        .unwrap();

        assert_eq!(rounds, 3);
        assert_eq!(drafts, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_canceled_round_leaves_state_untouched() {
        let token = CancelToken::new();
        let trigger = token.clone();
        // First round ties 4:4, the second favors the new prompt until canceled
        let generator = spo_generator(move |call, new_is_a| {
            if call < 8 {
                return "A";
            }
            if call == 15 {
                trigger.cancel();
            }
            if new_is_a {
                "A"
            } else {
                "B"
            }
        });
        let mut optimizer = SpoOptimizer::new(generator, options(&["q1", "q2"]));
        let ctx = RunContext::new().with_cancel_token(token);
        optimizer.initialize(&ctx).await.unwrap();
        assert!(!optimizer.optimize(&ctx).await.unwrap().accepted);

        let err = optimizer.optimize(&ctx).await.unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(optimizer.current_prompt(), "Answer.");
        assert_eq!(optimizer.current_answers(), ["old answer", "old answer"]);
        assert_eq!(optimizer.prompt_index(), 0);
        assert_eq!(optimizer.draft_index(), 1);
        assert_eq!(optimizer.history().len(), 1);
    }

    #[tokio::test]
    async fn test_optimize_before_initialize() {
        let generator = spo_generator(|_, _| "A");
        let mut optimizer = SpoOptimizer::new(generator, options(&["q1"]));

        let err = optimizer.optimize(&RunContext::new()).await.unwrap_err();
        assert!(matches!(err, ApoError::NotInitialized));
    }
}
