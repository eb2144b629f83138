//! Dual-phase optimizer options (JSON, camelCase keys)

use crate::apo::sentence::PromptSentences;
use crate::models::InputOutputPair;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HF: f64 = 0.3;
pub const DEFAULT_HV: f64 = 0.1;
pub const DEFAULT_MIXING_RATE: f64 = 0.4;
pub const DEFAULT_LEARNING_RATE: f64 = 0.055;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DualPhaseOptions {
    #[serde(default)]
    pub initialization: InitializationOptions,
    #[serde(default)]
    pub evaluation: EvaluationOptions,
    #[serde(default)]
    pub optimization: OptimizationOptions,
    /// Seed for sampling and shuffling; entropy when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationOptions {
    /// Initial prompt; when set, no prompt is synthesized
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub p0: String,
    /// Earlier draft the synthesized prompt continues from
    #[serde(default, rename = "previousP0", skip_serializing_if = "String::is_empty")]
    pub previous_p0: String,
    /// Number of training pairs generated from `previousP0` when
    /// `trainingData` is empty
    #[serde(default)]
    pub generate_training_data_pairs: usize,
    /// Few-shot pairs used to synthesize P0
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub training_data: Vec<InputOutputPair>,
    #[serde(default)]
    pub in_chinese: bool,
    /// Checkpoint to resume from; skips synthesis and segmentation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_with: Option<PromptSentences>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationOptions {
    #[serde(default)]
    pub validation_data: Vec<InputOutputPair>,
    #[serde(default)]
    pub evaluation_batch_size: i64,
}

impl EvaluationOptions {
    pub fn batch_size(&self) -> usize {
        if self.evaluation_batch_size <= 0 {
            1
        } else {
            self.evaluation_batch_size as usize
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationOptions {
    /// Fast-check threshold on the failed-case subset
    #[serde(default)]
    pub hf: f64,
    /// Minimum full-set improvement
    #[serde(default)]
    pub hv: f64,
    #[serde(default)]
    pub mixing_rate: f64,
    #[serde(default)]
    pub learning_rate: f64,
}

impl DualPhaseOptions {
    /// Fill unset values with defaults
    pub fn complete(&mut self) {
        let opt = &mut self.optimization;
        if opt.hf <= 0.0 {
            opt.hf = DEFAULT_HF;
        }
        if opt.hv <= 0.0 {
            opt.hv = DEFAULT_HV;
        }
        if opt.mixing_rate <= 0.0 {
            opt.mixing_rate = DEFAULT_MIXING_RATE;
        }
        if opt.learning_rate <= 0.0 {
            opt.learning_rate = DEFAULT_LEARNING_RATE;
        }
        if self.evaluation.evaluation_batch_size <= 0 {
            self.evaluation.evaluation_batch_size = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let mut opts: DualPhaseOptions = serde_json::from_str("{}").unwrap();
        opts.complete();

        assert_eq!(opts.optimization.hf, 0.3);
        assert_eq!(opts.optimization.hv, 0.1);
        assert_eq!(opts.optimization.mixing_rate, 0.4);
        assert_eq!(opts.optimization.learning_rate, 0.055);
        assert_eq!(opts.evaluation.batch_size(), 1);
        assert!(opts.seed.is_none());
    }

    #[test]
    fn test_parse_camel_case_options() {
        let raw = r#"{
            "initialization": {
                "previousP0": "draft",
                "generateTrainingDataPairs": 3,
                "trainingData": [{"input": "1+1", "output": "2"}],
                "inChinese": true,
                "continueWith": [{"content": "Add.", "suffix": "\n", "weight": 2.0, "ignore": false}]
            },
            "evaluation": {
                "validationData": [{"input": "2+2", "output": "4"}],
                "evaluationBatchSize": 4
            },
            "optimization": {"hf": 0.5, "mixingRate": 0.2},
            "seed": 11
        }"#;
        let mut opts: DualPhaseOptions = serde_json::from_str(raw).unwrap();
        opts.complete();

        assert_eq!(opts.initialization.previous_p0, "draft");
        assert_eq!(opts.initialization.generate_training_data_pairs, 3);
        assert!(opts.initialization.in_chinese);
        assert_eq!(opts.initialization.training_data.len(), 1);
        assert_eq!(opts.initialization.continue_with.as_ref().unwrap()[0].weight, 2.0);
        assert_eq!(opts.evaluation.batch_size(), 4);
        assert_eq!(opts.optimization.hf, 0.5);
        assert_eq!(opts.optimization.mixing_rate, 0.2);
        assert_eq!(opts.optimization.hv, 0.1);
        assert_eq!(opts.seed, Some(11));
    }
}
