//! Automatic prompt optimization
//!
//! Two unrelated strategies share only the optimizer shape:
//! - `dualphase`: sentence-level rewriting scored by exact-match accuracy
//! - `spo`: whole-prompt rewriting scored by pairwise LLM judgement
//!
//! LOOP:
//! INITIALIZE → OPTIMIZE → OPTIMIZE → ... until a terminal round or the budget runs out

use crate::context::RunContext;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod dualphase;
pub mod sentence;
pub mod spo;

pub use dualphase::DualPhaseOptimizer;
pub use sentence::{PromptSentences, Sentence, WeightedSentence};
pub use spo::SpoOptimizer;

/// How a round ended. None of these are failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoundOutcome {
    /// A new prompt replaced the current one
    Accepted,
    /// The candidate lost; the current prompt stays
    Rejected,
    /// Nothing left to fix: the current prompt has no failed cases
    Optimal,
    /// Every attempt of the round was rejected
    Exhausted,
}

impl RoundOutcome {
    /// Optimal and exhausted rounds end the run
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundOutcome::Optimal | RoundOutcome::Exhausted)
    }
}

/// Common view of a finished round
pub trait RoundSummary {
    fn outcome(&self) -> RoundOutcome;

    fn accepted(&self) -> bool {
        self.outcome() == RoundOutcome::Accepted
    }
}

/// Trait for prompt optimizers (LLM feedback only)
#[async_trait]
pub trait PromptOptimizer: Send {
    /// State handed back after initialization
    type Snapshot: Send;
    /// Result of one optimization round
    type Round: RoundSummary + Send;

    async fn initialize(&mut self, ctx: &RunContext) -> Result<Self::Snapshot>;

    async fn optimize(&mut self, ctx: &RunContext) -> Result<Self::Round>;
}

/// Drive up to `max_rounds` rounds, stopping early on a terminal outcome.
///
/// `on_round` sees every finished round. Returns the number of rounds run.
pub async fn run_rounds<O, F>(
    optimizer: &mut O,
    ctx: &RunContext,
    max_rounds: usize,
    mut on_round: F,
) -> Result<usize>
where
    O: PromptOptimizer,
    F: FnMut(usize, &O::Round),
{
    let mut accepted = 0;

    for round in 0..max_rounds {
        debug!(round, "Starting optimization round");
        let result = optimizer.optimize(ctx).await?;
        on_round(round, &result);

        if result.accepted() {
            accepted += 1;
        }

        if result.outcome().is_terminal() {
            info!(round, accepted, "Optimization reached a terminal outcome");
            return Ok(round + 1);
        }
    }

    info!(rounds = max_rounds, accepted, "Optimization round budget used up");
    Ok(max_rounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        outcomes: VecDeque<RoundOutcome>,
    }

    impl RoundSummary for RoundOutcome {
        fn outcome(&self) -> RoundOutcome {
            *self
        }
    }

    #[async_trait]
    impl PromptOptimizer for Scripted {
        type Snapshot = ();
        type Round = RoundOutcome;

        async fn initialize(&mut self, _ctx: &RunContext) -> Result<()> {
            Ok(())
        }

        async fn optimize(&mut self, _ctx: &RunContext) -> Result<RoundOutcome> {
            Ok(self.outcomes.pop_front().unwrap_or(RoundOutcome::Rejected))
        }
    }

    #[test]
    fn test_terminal_outcomes() {
        assert!(RoundOutcome::Optimal.is_terminal());
        assert!(RoundOutcome::Exhausted.is_terminal());
        assert!(!RoundOutcome::Accepted.is_terminal());
        assert!(!RoundOutcome::Rejected.is_terminal());
    }

    #[tokio::test]
    async fn test_run_rounds_stops_on_terminal_outcome() {
        let mut optimizer = Scripted {
            outcomes: VecDeque::from(vec![
                RoundOutcome::Accepted,
                RoundOutcome::Rejected,
                RoundOutcome::Exhausted,
                RoundOutcome::Accepted,
            ]),
        };

        let mut seen = Vec::new();
        let rounds = run_rounds(&mut optimizer, &RunContext::new(), 10, |i, round: &RoundOutcome| {
            seen.push((i, *round))
        })
        .await
        .unwrap();

        assert_eq!(rounds, 3);
        assert_eq!(seen.last(), Some(&(2, RoundOutcome::Exhausted)));
        assert_eq!(optimizer.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_run_rounds_respects_budget() {
        let mut optimizer = Scripted {
            outcomes: VecDeque::new(),
        };

        let rounds = run_rounds(&mut optimizer, &RunContext::new(), 4, |_, _| {})
            .await
            .unwrap();

        assert_eq!(rounds, 4);
    }
}
