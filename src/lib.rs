//! Financial Agent APO Engine
//!
//! Automatic prompt optimization for the agent's system prompts:
//! - Dual-phase accelerated optimization: weighted sentence sampling with a
//!   fast check on failed cases and a full check on the validation set
//! - Self-supervised optimization: whole-prompt rewrites judged pairwise
//!   against the current prompt's answers
//!
//! LOOP:
//! INITIALIZE → OPTIMIZE → (ACCEPT | REJECT) → OPTIMIZE? → OPTIMAL / EXHAUSTED

pub mod apo;
pub mod config;
pub mod context;
pub mod error;
pub mod generation;
pub mod history;
pub mod models;
pub mod report;

pub use error::{ApoError, Result};

// Re-export common types
pub use apo::{run_rounds, PromptOptimizer, RoundOutcome, RoundSummary};
pub use context::{CancelToken, RunContext};
pub use generation::{Generator, MockGenerator};
pub use models::*;
