use std::collections::HashSet;
use std::sync::LazyLock;

use quill_types::{GenerationRequest, RuleViolation, Severity};
use regex::Regex;

use crate::config::RuleConfig;
use crate::text;

pub const MISSING_ENTITY: &str = "missing-entity";
pub const FORBIDDEN_TERM: &str = "forbidden-term";
pub const MIN_LENGTH: &str = "min-length";
pub const MAX_LENGTH: &str = "max-length";
pub const PLACEHOLDER_LEAK: &str = "placeholder-leak";
pub const ASSISTANT_DISCLAIMER: &str = "assistant-disclaimer";
pub const REPEATED_PARAGRAPH: &str = "repeated-paragraph";
pub const TRUNCATED_ENDING: &str = "truncated-ending";

/// Unrendered template variables and editorial markers.
pub static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*[\w.-]+\s*\}\}|\[(?:TODO|TBD|INSERT[^\]]*|PLACEHOLDER)\]")
        .expect("placeholder pattern")
});

/// Model self-references that break the fiction.
pub static DISCLAIMER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:as an ai(?: language model)?|i(?:'m| am) (?:just )?an ai|i cannot (?:write|continue) (?:this|that))\b[^.!?\n]*[.!?]?")
        .expect("disclaimer pattern")
});

/// Structural and content rules over generated prose.
pub struct RuleChecker {
    cfg: RuleConfig,
    forbidden: Vec<(String, Regex)>,
}

impl RuleChecker {
    pub fn new(cfg: RuleConfig) -> Self {
        let forbidden = cfg
            .forbidden_terms
            .iter()
            .filter_map(|t| forbidden_pattern(t).map(|re| (t.clone(), re)))
            .collect();
        Self { cfg, forbidden }
    }

    pub fn config(&self) -> &RuleConfig {
        &self.cfg
    }

    pub fn check(&self, output: &str, req: &GenerationRequest) -> Vec<RuleViolation> {
        let mut out = Vec::new();
        self.check_entities(output, req, &mut out);
        self.check_forbidden(output, &mut out);
        self.check_length(output, &mut out);
        if self.cfg.check_placeholders {
            for m in PLACEHOLDER.find_iter(output) {
                out.push(violation(
                    PLACEHOLDER_LEAK,
                    Severity::Error,
                    format!("unrendered placeholder {}", m.as_str()),
                    Some(m.as_str()),
                ));
            }
        }
        if self.cfg.check_disclaimers {
            for m in DISCLAIMER.find_iter(output) {
                out.push(violation(
                    ASSISTANT_DISCLAIMER,
                    Severity::Error,
                    "model broke character with an assistant disclaimer".into(),
                    Some(m.as_str()),
                ));
            }
        }
        if self.cfg.check_repetition {
            let mut seen = HashSet::new();
            for p in text::paragraphs(output) {
                if !seen.insert(text::normalize(p)) {
                    out.push(violation(
                        REPEATED_PARAGRAPH,
                        Severity::Warning,
                        "paragraph repeats an earlier one".into(),
                        Some(p),
                    ));
                }
            }
        }
        if self.cfg.check_truncation && !output.trim().is_empty() && !text::ends_cleanly(output) {
            let tail = text::sentences(output).last().copied().unwrap_or_default();
            out.push(violation(
                TRUNCATED_ENDING,
                Severity::Warning,
                "output stops mid-sentence".into(),
                Some(tail),
            ));
        }
        out
    }

    fn check_entities(&self, output: &str, req: &GenerationRequest, out: &mut Vec<RuleViolation>) {
        let lower = output.to_lowercase();
        for entity in &req.required_entities {
            if !lower.contains(&entity.to_lowercase()) {
                out.push(violation(
                    MISSING_ENTITY,
                    Severity::Error,
                    format!("required entity '{entity}' is never mentioned"),
                    Some(entity),
                ));
            }
        }
    }

    fn check_forbidden(&self, output: &str, out: &mut Vec<RuleViolation>) {
        for (term, re) in &self.forbidden {
            for m in re.find_iter(output) {
                out.push(violation(
                    FORBIDDEN_TERM,
                    Severity::Error,
                    format!("forbidden term '{term}'"),
                    Some(m.as_str()),
                ));
            }
        }
    }

    fn check_length(&self, output: &str, out: &mut Vec<RuleViolation>) {
        let n = text::words(output).len();
        if n < self.cfg.min_words {
            out.push(violation(
                MIN_LENGTH,
                Severity::Error,
                format!("{n} words, expected at least {}", self.cfg.min_words),
                None,
            ));
        }
        if let Some(max) = self.cfg.max_words {
            if n > max {
                out.push(violation(
                    MAX_LENGTH,
                    Severity::Warning,
                    format!("{n} words, expected at most {max}"),
                    None,
                ));
            }
        }
    }
}

/// Case-insensitive whole-word matcher for a configured term.
pub fn forbidden_pattern(term: &str) -> Option<Regex> {
    let term = term.trim();
    if term.is_empty() {
        return None;
    }
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(term, error = %e, "skipping unusable forbidden term");
            None
        }
    }
}

fn violation(rule_id: &str, severity: Severity, message: String, span: Option<&str>) -> RuleViolation {
    RuleViolation {
        rule_id: rule_id.to_string(),
        severity,
        message,
        span: span.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_types::{GenerationParams, RequestContext};
    use std::collections::BTreeMap;

    fn request(entities: &[&str]) -> GenerationRequest {
        GenerationRequest {
            template_id: "scene".into(),
            template_version: 1,
            rendered_prompt: "p".into(),
            variables: BTreeMap::new(),
            model_class: "prose".into(),
            params: GenerationParams::default(),
            context: RequestContext::default(),
            hints: None,
            required_entities: entities.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn checker() -> RuleChecker {
        RuleChecker::new(RuleConfig {
            min_words: 3,
            forbidden_terms: vec!["suddenly".into()],
            ..RuleConfig::default()
        })
    }

    fn ids(v: &[RuleViolation]) -> Vec<&str> {
        v.iter().map(|v| v.rule_id.as_str()).collect()
    }

    #[test]
    fn flags_missing_entity_as_error() {
        let v = checker().check("Mara ran to the pier.", &request(&["Mara", "Ilse"]));
        assert_eq!(ids(&v), vec![MISSING_ENTITY]);
        assert_eq!(v[0].severity, Severity::Error);
        assert_eq!(v[0].span.as_deref(), Some("Ilse"));
    }

    #[test]
    fn forbidden_terms_match_whole_words_only() {
        let v = checker().check("Suddenly the door slammed.", &request(&[]));
        assert_eq!(ids(&v), vec![FORBIDDEN_TERM]);
        assert_eq!(v[0].span.as_deref(), Some("Suddenly"));

        let v = checker().check("The suddenlyness of it all was strange.", &request(&[]));
        assert!(v.is_empty());
    }

    #[test]
    fn detects_placeholders_and_disclaimers() {
        let text = "As an AI language model, I will try. {{ hero }} walked in [TODO].";
        let v = checker().check(text, &request(&[]));
        let found = ids(&v);
        assert!(found.contains(&PLACEHOLDER_LEAK));
        assert!(found.contains(&ASSISTANT_DISCLAIMER));
        assert_eq!(v.iter().filter(|v| v.rule_id == PLACEHOLDER_LEAK).count(), 2);
    }

    #[test]
    fn repetition_and_truncation_are_warnings() {
        let text = "The tide rose.\n\nThe tide rose.\n\nShe reached for the";
        let v = checker().check(text, &request(&[]));
        let warn: Vec<_> = v.iter().filter(|v| v.severity == Severity::Warning).collect();
        assert_eq!(warn.len(), 2);
        assert!(v.iter().all(|v| v.severity == Severity::Warning));
    }

    #[test]
    fn too_short_is_blocking() {
        let v = checker().check("Rain.", &request(&[]));
        assert_eq!(ids(&v), vec![MIN_LENGTH]);
        assert!(v[0].is_blocking());
    }
}
