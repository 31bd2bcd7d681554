//! Quality scoring and rule checking for generated prose.
//!
//! The evaluator produces four dimension scores plus a weighted overall score;
//! the rule checker runs independently and emits warning/error violations.
//! Error-severity violations block acceptance whatever the score.

pub mod config;
pub mod rules;
pub mod text;

pub use config::{DimensionWeights, QualityConfig, RuleConfig};
pub use rules::RuleChecker;

use quill_types::{GenerationRequest, QualityScore, RuleViolation};

/// Score plus violations for one candidate output.
#[derive(Clone, Debug, PartialEq)]
pub struct QualityReport {
    pub score: QualityScore,
    pub violations: Vec<RuleViolation>,
    pub accepted: bool,
}

impl QualityReport {
    pub fn blocking(&self) -> impl Iterator<Item = &RuleViolation> {
        self.violations.iter().filter(|v| v.is_blocking())
    }

    pub fn has_blocking(&self) -> bool {
        self.blocking().next().is_some()
    }
}

pub struct QualityEvaluator {
    cfg: QualityConfig,
    checker: RuleChecker,
}

impl QualityEvaluator {
    pub fn new(cfg: QualityConfig) -> Self {
        let checker = RuleChecker::new(cfg.rules.clone());
        Self { cfg, checker }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.cfg
    }

    pub fn checker(&self) -> &RuleChecker {
        &self.checker
    }

    pub fn evaluate(&self, output: &str, req: &GenerationRequest) -> QualityReport {
        let score = self.score(output, req);
        let violations = self.checker.check(output, req);
        let accepted = self.accepts(&score, &violations);
        tracing::debug!(
            overall = score.overall,
            violations = violations.len(),
            accepted,
            "quality evaluated"
        );
        QualityReport {
            score,
            violations,
            accepted,
        }
    }

    /// Minimum-acceptance bar: no error violations and overall at or above the floor.
    pub fn accepts(&self, score: &QualityScore, violations: &[RuleViolation]) -> bool {
        !violations.iter().any(RuleViolation::is_blocking) && score.overall >= self.cfg.min_acceptance
    }

    pub fn score(&self, output: &str, req: &GenerationRequest) -> QualityScore {
        let words = text::words(output);
        let sentences = text::sentences(output);
        if words.is_empty() {
            return QualityScore {
                suggestions: vec!["The model returned no text; regenerate.".to_string()],
                ..QualityScore::default()
            };
        }

        let completeness = completeness(words.len(), self.cfg.rules.min_words, output);
        let consistency = consistency(output, req, &self.cfg.rules.forbidden_terms);
        let coherence = coherence(&sentences);
        let fluency = fluency(&words, &sentences);

        let w = &self.cfg.weights;
        let total = (w.completeness + w.consistency + w.coherence + w.fluency).max(f64::EPSILON);
        let overall = (w.completeness * completeness
            + w.consistency * consistency
            + w.coherence * coherence
            + w.fluency * fluency)
            / total;

        let mut suggestions = Vec::new();
        let floor = self.cfg.suggestion_floor;
        if completeness < floor {
            suggestions.push("Extend the passage and close the final sentence.".to_string());
        }
        if consistency < floor {
            suggestions.push("Mention every character and place the scene requires.".to_string());
        }
        if coherence < floor {
            suggestions.push("Remove repeated sentences and keep one line of action.".to_string());
        }
        if fluency < floor {
            suggestions.push("Vary sentence length and avoid repeated words.".to_string());
        }

        QualityScore {
            overall,
            completeness,
            consistency,
            coherence,
            fluency,
            suggestions,
        }
    }
}

fn completeness(word_count: usize, min_words: usize, output: &str) -> f64 {
    if word_count == 0 {
        return 0.0;
    }
    let length = (word_count as f64 / min_words.max(1) as f64).min(1.0);
    let closure = if text::ends_cleanly(output) { 1.0 } else { 0.8 };
    length * closure
}

fn consistency(output: &str, req: &GenerationRequest, forbidden: &[String]) -> f64 {
    let lower = output.to_lowercase();
    let entity_ratio = if req.required_entities.is_empty() {
        1.0
    } else {
        let present = req
            .required_entities
            .iter()
            .filter(|e| lower.contains(&e.to_lowercase()))
            .count();
        present as f64 / req.required_entities.len() as f64
    };
    let leaks = forbidden
        .iter()
        .filter(|t| lower.contains(&t.to_lowercase()))
        .count();
    (entity_ratio - 0.2 * leaks as f64).clamp(0.0, 1.0)
}

fn coherence(sentences: &[&str]) -> f64 {
    if sentences.is_empty() {
        return 0.0;
    }
    let mut seen = std::collections::HashSet::new();
    let unique = sentences
        .iter()
        .filter(|s| seen.insert(text::normalize(s)))
        .count();
    unique as f64 / sentences.len() as f64
}

fn fluency(words: &[&str], sentences: &[&str]) -> f64 {
    if words.is_empty() || sentences.is_empty() {
        return 0.0;
    }
    let avg = words.len() as f64 / sentences.len() as f64;
    let length_fit = if (6.0..=30.0).contains(&avg) {
        1.0
    } else if avg < 6.0 {
        avg / 6.0
    } else {
        (30.0 / avg).max(0.2)
    };

    let stutters = words
        .windows(2)
        .filter(|w| w[0].eq_ignore_ascii_case(w[1]))
        .count();
    let stutter_penalty = (stutters as f64 / words.len() as f64 * 5.0).min(0.5);
    (length_fit - stutter_penalty).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_types::{GenerationParams, RequestContext, Severity};
    use std::collections::BTreeMap;

    const GOOD: &str = "Mara climbed the lighthouse stairs while the storm pressed against the glass. \
        Below her, the harbour lights shivered in the rain and the boats strained at their ropes. \
        She counted the steps the way her father had taught her, slowly and without fear. \
        At the top the lamp was dark, and Ilse was waiting beside it with a lantern of her own. \
        Neither of them spoke until the first wave broke over the pier.";

    fn request(entities: &[&str]) -> GenerationRequest {
        GenerationRequest {
            template_id: "scene".into(),
            template_version: 1,
            rendered_prompt: "Write the lighthouse scene.".into(),
            variables: BTreeMap::new(),
            model_class: "prose".into(),
            params: GenerationParams::default(),
            context: RequestContext::default(),
            hints: None,
            required_entities: entities.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn clean_prose_is_accepted() {
        let eval = QualityEvaluator::new(QualityConfig::default());
        let report = eval.evaluate(GOOD, &request(&["Mara", "Ilse"]));
        assert!(report.violations.is_empty(), "{:?}", report.violations);
        assert!(report.accepted);
        assert!(report.score.overall > 0.8);
    }

    #[test]
    fn overall_weights_completeness_over_fluency() {
        let cfg = QualityConfig::default();
        assert!(cfg.weights.completeness > cfg.weights.fluency);
        assert!(cfg.weights.consistency > cfg.weights.fluency);
    }

    #[test]
    fn error_violation_blocks_even_with_high_score() {
        let cfg = QualityConfig {
            min_acceptance: 0.1,
            rules: RuleConfig {
                forbidden_terms: vec!["lantern".into()],
                ..RuleConfig::default()
            },
            ..QualityConfig::default()
        };
        let eval = QualityEvaluator::new(cfg);
        let report = eval.evaluate(GOOD, &request(&["Mara"]));
        assert!(report.score.overall > 0.7);
        assert!(report.has_blocking());
        assert!(!report.accepted);
    }

    #[test]
    fn warnings_do_not_block() {
        let cfg = QualityConfig {
            rules: RuleConfig {
                max_words: Some(20),
                ..RuleConfig::default()
            },
            ..QualityConfig::default()
        };
        let eval = QualityEvaluator::new(cfg);
        let report = eval.evaluate(GOOD, &request(&[]));
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "max-length" && v.severity == Severity::Warning));
        assert!(report.accepted);
    }

    #[test]
    fn repeated_sentences_hurt_coherence() {
        let eval = QualityEvaluator::new(QualityConfig::default());
        let text = "The door opened. The door opened. The door opened. Rain fell.";
        let score = eval.score(text, &request(&[]));
        assert!(score.coherence <= 0.5);
        assert!(!score.suggestions.is_empty());
    }

    #[test]
    fn empty_output_scores_zero() {
        let eval = QualityEvaluator::new(QualityConfig::default());
        let report = eval.evaluate("", &request(&[]));
        assert_eq!(report.score.overall, 0.0);
        assert!(!report.accepted);
    }
}
