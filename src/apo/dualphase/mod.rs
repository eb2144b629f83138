//! Dual-phase accelerated prompt optimizer
//!
//! Sentence-level search: sample a sentence by weight, rewrite it, check the
//! rewrite on the failed cases (fast phase), then on the whole validation set
//! (full phase). Accepted rewrites raise the weights of rarely sampled
//! sentences.

use crate::apo::sentence::{segment, PromptSentences};
use crate::apo::{PromptOptimizer, RoundOutcome, RoundSummary};
use crate::context::RunContext;
use crate::error::ApoError;
use crate::generation::Generator;
use crate::history::PromptHistory;
use crate::models::{EvaluationReport, FailedCase, InputOutputPair};
use crate::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod evaluation;
pub mod initialization;
pub mod optimization;
pub mod options;

pub use options::{DualPhaseOptions, EvaluationOptions, InitializationOptions, OptimizationOptions};

const MAX_ATTEMPTS_PER_ROUND: usize = 6;
const MAX_REJECTIONS_PER_SENTENCE: usize = 2;
const MAX_DUPLICATE_REWRITES: usize = 12;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Uninitialized,
    Ready,
    Converged,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualPhaseSnapshot {
    pub prompt: PromptSentences,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualPhaseRound {
    pub prompt: PromptSentences,
    pub accuracy: f64,
    pub outcome: RoundOutcome,
    /// Counted rewrite attempts
    pub attempts: usize,
    /// Sentence rewritten by the accepted candidate
    pub sentence_index: Option<usize>,
}

impl RoundSummary for DualPhaseRound {
    fn outcome(&self) -> RoundOutcome {
        self.outcome
    }
}

pub struct DualPhaseOptimizer {
    session_id: Uuid,
    opts: DualPhaseOptions,
    generator: Arc<dyn Generator>,
    rng: StdRng,
    phase: Phase,
    history: PromptHistory,
    cur_prompt: PromptSentences,
    cur_accuracy: f64,
    cur_failed_cases: Vec<FailedCase>,
}

impl DualPhaseOptimizer {
    pub fn new(generator: Arc<dyn Generator>, mut opts: DualPhaseOptions) -> Self {
        opts.complete();
        let rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            session_id: Uuid::new_v4(),
            opts,
            generator,
            rng,
            phase: Phase::Uninitialized,
            history: PromptHistory::new(),
            cur_prompt: PromptSentences::default(),
            cur_accuracy: 0.0,
            cur_failed_cases: Vec::new(),
        }
    }

    /// Replace the random source
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn options(&self) -> &DualPhaseOptions {
        &self.opts
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_prompt(&self) -> &PromptSentences {
        &self.cur_prompt
    }

    pub fn current_accuracy(&self) -> f64 {
        self.cur_accuracy
    }

    pub fn failed_cases(&self) -> &[FailedCase] {
        &self.cur_failed_cases
    }

    pub fn history(&self) -> &PromptHistory {
        &self.history
    }

    fn snapshot(&self) -> DualPhaseSnapshot {
        DualPhaseSnapshot {
            prompt: self.cur_prompt.clone(),
            accuracy: self.cur_accuracy,
        }
    }

    fn round(&self, outcome: RoundOutcome, attempts: usize, sentence_index: Option<usize>) -> DualPhaseRound {
        DualPhaseRound {
            prompt: self.cur_prompt.clone(),
            accuracy: self.cur_accuracy,
            outcome,
            attempts,
            sentence_index,
        }
    }

    /// Build P0 from the checkpoint, the given text, or the training data.
    /// Also returns any training pairs generated along the way.
    async fn initial_prompt(&self, ctx: &RunContext) -> Result<(PromptSentences, Vec<InputOutputPair>)> {
        let init = &self.opts.initialization;
        if let Some(checkpoint) = &init.continue_with {
            debug!(session_id = %self.session_id, "Continuing from checkpoint");
            return Ok((checkpoint.clone(), Vec::new()));
        }

        let mut generated = Vec::new();
        let p0 = if init.p0.is_empty() {
            if init.training_data.is_empty() {
                generated = initialization::generate_training_pairs(
                    self.generator.as_ref(),
                    ctx,
                    &init.previous_p0,
                    init.generate_training_data_pairs,
                )
                .await?;
            }
            let training_data = if generated.is_empty() {
                &init.training_data
            } else {
                &generated
            };

            initialization::synthesize_p0(
                self.generator.as_ref(),
                ctx,
                &init.previous_p0,
                training_data,
                init.in_chinese,
            )
            .await?
        } else {
            init.p0.clone()
        };

        let sentences = segment(self.generator.as_ref(), ctx, &p0).await?;
        Ok((PromptSentences::from_sentences(sentences), generated))
    }

    /// Score `prompt` on the validation set, or on the current failed cases
    async fn evaluate(
        &mut self,
        ctx: &RunContext,
        prompt: &str,
        failed_only: bool,
    ) -> Result<EvaluationReport> {
        let data: Vec<InputOutputPair> = if failed_only {
            self.cur_failed_cases.iter().map(FailedCase::to_pair).collect()
        } else {
            self.opts.evaluation.validation_data.clone()
        };
        self.score(ctx, prompt, data).await
    }

    async fn score(
        &mut self,
        ctx: &RunContext,
        prompt: &str,
        mut data: Vec<InputOutputPair>,
    ) -> Result<EvaluationReport> {
        if data.is_empty() {
            return Err(ApoError::NoValidationData);
        }
        data.shuffle(&mut self.rng);

        evaluation::evaluate_pairs(
            self.generator.as_ref(),
            ctx,
            prompt,
            &data,
            self.opts.evaluation.batch_size(),
        )
        .await
    }

    fn resample(&mut self, current: usize) -> Result<usize> {
        self.cur_prompt
            .sample_excluding(&mut self.rng, current)
            .ok_or(ApoError::NoOptimizableSentence)
    }

    /// Run one optimization round
    async fn optimize_round(&mut self, ctx: &RunContext) -> Result<DualPhaseRound> {
        if self.phase == Phase::Uninitialized {
            return Err(ApoError::NotInitialized);
        }

        if self.cur_failed_cases.is_empty() {
            info!(session_id = %self.session_id, "Current prompt has no failed cases");
            self.phase = Phase::Converged;
            return Ok(self.round(RoundOutcome::Optimal, 0, None));
        }

        let opt = self.opts.optimization;
        let mut sentence_i = self
            .cur_prompt
            .sample(&mut self.rng)
            .ok_or(ApoError::NoOptimizableSentence)?;
        let mut rejected: Vec<String> = Vec::new();
        let mut attempts = 0;
        let mut duplicates = 0;

        while attempts < MAX_ATTEMPTS_PER_ROUND {
            let current_text = self.cur_prompt.to_string();
            let new_sentence = optimization::rewrite_sentence(
                self.generator.as_ref(),
                ctx,
                &current_text,
                self.cur_prompt[sentence_i].content(),
                &self.cur_failed_cases,
            )
            .await?;

            if rejected.contains(&new_sentence) {
                duplicates += 1;
                debug!(sentence_index = sentence_i, duplicates, "Rewrite repeats a rejected one");
                if duplicates > MAX_DUPLICATE_REWRITES {
                    warn!(session_id = %self.session_id, "Too many repeated rewrites, ending round");
                    break;
                }
                continue;
            }
            attempts += 1;

            let candidate = self.cur_prompt.with_content(sentence_i, new_sentence.as_str());
            let candidate_text = candidate.to_string();

            // Fast phase on the failed cases
            let accuracy_f = self.evaluate(ctx, &candidate_text, true).await?.accuracy();
            info!(
                session_id = %self.session_id,
                attempt = attempts,
                sentence_index = sentence_i,
                accuracy = accuracy_f,
                threshold = opt.hf,
                "New prompt's accuracy in failed cases"
            );

            if accuracy_f < opt.hf {
                rejected.push(new_sentence);
                if rejected.len() >= MAX_REJECTIONS_PER_SENTENCE {
                    sentence_i = self.resample(sentence_i)?;
                    rejected.clear();
                    debug!(sentence_index = sentence_i, "Switched sentence after repeated rejections");
                }
                continue;
            }

            // Full phase on the validation set
            let full = self.evaluate(ctx, &candidate_text, false).await?;
            let accuracy_v = full.accuracy();
            info!(
                session_id = %self.session_id,
                attempt = attempts,
                accuracy = accuracy_v,
                previous = self.cur_accuracy,
                threshold = opt.hv,
                "New prompt's accuracy in full cases"
            );

            let not_better = accuracy_v <= self.cur_accuracy;
            let too_small = self.cur_accuracy < 1.0 - opt.hv && accuracy_v - self.cur_accuracy < opt.hv;
            if not_better || too_small {
                sentence_i = self.resample(sentence_i)?;
                rejected.clear();
                continue;
            }

            let accuracy_mixed = accuracy_v * opt.mixing_rate + accuracy_f * (1.0 - opt.mixing_rate);
            let mut accepted = candidate;
            accepted.update_weight(accuracy_mixed, opt.learning_rate);

            info!(
                session_id = %self.session_id,
                weights = ?accepted.weights(),
                accuracy = accuracy_v,
                "Accepted new prompt"
            );

            self.history.record(accepted.to_string(), Some(accuracy_v));
            self.cur_accuracy = accuracy_v;
            self.cur_failed_cases = full.failed_cases;
            self.cur_prompt = accepted;
            self.phase = Phase::Ready;

            return Ok(self.round(RoundOutcome::Accepted, attempts, Some(sentence_i)));
        }

        info!(session_id = %self.session_id, attempts, "Current result has already converged");
        self.phase = Phase::Exhausted;
        Ok(self.round(RoundOutcome::Exhausted, attempts, None))
    }
}

#[async_trait]
impl PromptOptimizer for DualPhaseOptimizer {
    type Snapshot = DualPhaseSnapshot;
    type Round = DualPhaseRound;

    async fn initialize(&mut self, ctx: &RunContext) -> Result<DualPhaseSnapshot> {
        info!(session_id = %self.session_id, "Initializing dual-phase optimizer");

        let (prompt, generated) = self.initial_prompt(ctx).await?;

        // Generated pairs stand in for missing validation data
        let validation_data = if self.opts.evaluation.validation_data.is_empty() {
            generated.clone()
        } else {
            self.opts.evaluation.validation_data.clone()
        };

        let (accuracy, failed_cases) = if validation_data.is_empty() {
            (1.0, Vec::new())
        } else {
            let report = self.score(ctx, &prompt.to_string(), validation_data.clone()).await?;
            (report.accuracy(), report.failed_cases)
        };

        info!(
            session_id = %self.session_id,
            sentences = prompt.len(),
            accuracy,
            failed = failed_cases.len(),
            "Initial prompt evaluated"
        );

        if !generated.is_empty() {
            self.opts.initialization.training_data = generated;
            self.opts.evaluation.validation_data = validation_data;
        }
        self.history = PromptHistory::new();
        self.history.record(prompt.to_string(), Some(accuracy));
        self.cur_prompt = prompt;
        self.cur_accuracy = accuracy;
        self.cur_failed_cases = failed_cases;
        self.phase = Phase::Ready;

        Ok(self.snapshot())
    }

    async fn optimize(&mut self, ctx: &RunContext) -> Result<DualPhaseRound> {
        self.optimize_round(ctx).await
    }
}
