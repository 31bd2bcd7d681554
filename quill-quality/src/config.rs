use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DimensionWeights {
    pub completeness: f64,
    pub consistency: f64,
    pub coherence: f64,
    pub fluency: f64,
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            completeness: 0.35,
            consistency: 0.30,
            coherence: 0.20,
            fluency: 0.15,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RuleConfig {
    pub min_words: usize,
    pub max_words: Option<usize>,
    pub forbidden_terms: Vec<String>,
    pub check_placeholders: bool,
    pub check_disclaimers: bool,
    pub check_repetition: bool,
    pub check_truncation: bool,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            min_words: 40,
            max_words: None,
            forbidden_terms: Vec::new(),
            check_placeholders: true,
            check_disclaimers: true,
            check_repetition: true,
            check_truncation: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Overall score floor below which output is rejected outright.
    pub min_acceptance: f64,
    /// Dimensions below this get an improvement suggestion.
    pub suggestion_floor: f64,
    pub weights: DimensionWeights,
    pub rules: RuleConfig,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_acceptance: 0.55,
            suggestion_floor: 0.6,
            weights: DimensionWeights::default(),
            rules: RuleConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: QualityConfig =
            serde_yaml::from_str("min_acceptance: 0.7\nrules:\n  forbidden_terms: [\"lorem\"]\n").unwrap();
        assert_eq!(cfg.min_acceptance, 0.7);
        assert_eq!(cfg.rules.forbidden_terms, vec!["lorem"]);
        assert_eq!(cfg.rules.min_words, 40);
        assert_eq!(cfg.weights.completeness, 0.35);
    }
}
