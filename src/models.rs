//! Core data models shared by the optimizers

use serde::{Deserialize, Serialize};

//
// ================= Evaluation Data =================
//

/// Example input with its expected output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputOutputPair {
    pub input: String,
    pub output: String,
}

impl InputOutputPair {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

/// Validation item whose generated output differed from the expected one
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedCase {
    pub input: String,
    pub expected: String,
    pub actual: String,
}

impl FailedCase {
    /// The case as an input/output pair, for re-evaluation
    pub fn to_pair(&self) -> InputOutputPair {
        InputOutputPair {
            input: self.input.clone(),
            output: self.expected.clone(),
        }
    }
}

//
// ================= Evaluation Report =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationReport {
    pub correct: usize,
    pub wrong: usize,
    pub batches: usize,
    pub failed_cases: Vec<FailedCase>,
}

impl EvaluationReport {
    /// `correct / (correct + wrong)`, 0 for an empty report
    pub fn accuracy(&self) -> f64 {
        let total = self.correct + self.wrong;
        if total == 0 {
            return 0.0;
        }
        self.correct as f64 / total as f64
    }

    pub fn total(&self) -> usize {
        self.correct + self.wrong
    }

    pub fn merge(&mut self, other: EvaluationReport) {
        self.correct += other.correct;
        self.wrong += other.wrong;
        self.batches += other.batches;
        self.failed_cases.extend(other.failed_cases);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_accuracy() {
        let mut report = EvaluationReport {
            correct: 1,
            wrong: 0,
            batches: 1,
            failed_cases: vec![],
        };
        report.merge(EvaluationReport {
            correct: 0,
            wrong: 1,
            batches: 1,
            failed_cases: vec![FailedCase {
                input: "3+3".to_string(),
                expected: "7".to_string(),
                actual: "6".to_string(),
            }],
        });

        assert_eq!(report.total(), 2);
        assert_eq!(report.batches, 2);
        assert!((report.accuracy() - 0.5).abs() < f64::EPSILON);
        assert_eq!(report.failed_cases[0].to_pair(), InputOutputPair::new("3+3", "7"));
    }

    #[test]
    fn test_empty_report_accuracy() {
        assert_eq!(EvaluationReport::default().accuracy(), 0.0);
    }
}
