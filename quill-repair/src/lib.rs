//! Targeted fixes for rule violations.
//!
//! Each violation is repaired independently against the current text. A repair
//! that cannot be produced, or whose confidence is under the bar, leaves the
//! violation in place; the caller re-scores the result afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use quill_quality::rules;
use quill_quality::text;
use quill_types::{GenerationRequest, ModelTier, RepairAction, RepairMethod, RuleViolation};
use serde::{Deserialize, Serialize};

pub mod assist;
pub use assist::ModelRepairAssistant;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Forbidden term -> replacement. Terms without an entry are not auto-repaired.
    pub replacements: BTreeMap<String, String>,
    /// Repairs below this confidence are discarded.
    pub min_confidence: f64,
    pub max_words: Option<usize>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            replacements: BTreeMap::new(),
            min_confidence: 0.7,
            max_words: None,
        }
    }
}

/// A proposed span rewrite.
#[derive(Clone, Debug, PartialEq)]
pub struct Proposal {
    pub original: String,
    pub replacement: String,
    pub confidence: f64,
}

/// Tokens a model call made on behalf of a repair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssistUsage {
    pub tier: ModelTier,
    pub tokens: u32,
}

/// An assistant's answer. Usage is reported even when no proposal comes back.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Assisted {
    pub proposal: Option<Proposal>,
    pub usage: Option<AssistUsage>,
}

impl Assisted {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Model-backed repair for violations with no deterministic fix.
#[async_trait]
pub trait RepairAssistant: Send + Sync {
    async fn propose(&self, violation: &RuleViolation, text: &str, req: &GenerationRequest) -> Assisted;
}

#[derive(Clone, Debug, PartialEq)]
pub struct RepairOutcome {
    pub text: String,
    pub actions: Vec<RepairAction>,
    pub unrepaired: Vec<RuleViolation>,
    /// Model spend across all assisted proposals, accepted or not.
    pub usage: Vec<AssistUsage>,
}

pub struct RepairEngine {
    cfg: RepairConfig,
    assistant: Option<Arc<dyn RepairAssistant>>,
}

impl RepairEngine {
    pub fn new(cfg: RepairConfig) -> Self {
        Self {
            cfg,
            assistant: None,
        }
    }

    pub fn with_assistant(mut self, assistant: Arc<dyn RepairAssistant>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    pub async fn repair(
        &self,
        output: &str,
        violations: &[RuleViolation],
        req: &GenerationRequest,
    ) -> RepairOutcome {
        let mut current = output.to_string();
        let mut actions = Vec::new();
        let mut unrepaired = Vec::new();
        let mut usage = Vec::new();

        for v in violations {
            let proposal = match self.deterministic(v, &current, req) {
                Some(p) => Some((p, RepairMethod::Deterministic)),
                None => match &self.assistant {
                    Some(a) => {
                        let assisted = a.propose(v, &current, req).await;
                        usage.extend(assisted.usage);
                        assisted.proposal.map(|p| (p, RepairMethod::ModelAssisted))
                    }
                    None => None,
                },
            };

            let applied = proposal
                .filter(|(p, _)| p.confidence >= self.cfg.min_confidence)
                .and_then(|(p, method)| apply(&current, &p).map(|next| (p, method, next)));

            match applied {
                Some((p, method, next)) => {
                    tracing::debug!(rule = %v.rule_id, ?method, "repair applied");
                    current = next;
                    actions.push(RepairAction {
                        violation: v.rule_id.clone(),
                        original: p.original,
                        replacement: p.replacement,
                        method,
                        confidence: p.confidence,
                    });
                }
                None => {
                    tracing::debug!(rule = %v.rule_id, "no acceptable repair");
                    unrepaired.push(v.clone());
                }
            }
        }

        RepairOutcome {
            text: current,
            actions,
            unrepaired,
            usage,
        }
    }

    fn deterministic(&self, v: &RuleViolation, current: &str, req: &GenerationRequest) -> Option<Proposal> {
        let span = v.span.as_deref();
        match v.rule_id.as_str() {
            rules::FORBIDDEN_TERM => {
                let found = span?;
                let replacement = self
                    .cfg
                    .replacements
                    .iter()
                    .find(|(term, _)| term.eq_ignore_ascii_case(found))
                    .map(|(_, r)| match_case(found, r))?;
                Some(Proposal {
                    original: found.to_string(),
                    replacement,
                    confidence: 0.95,
                })
            }
            rules::PLACEHOLDER_LEAK => {
                let found = span?;
                let name = found
                    .strip_prefix("{{")
                    .and_then(|s| s.strip_suffix("}}"))
                    .map(str::trim);
                match name.and_then(|n| req.variables.get(n)) {
                    Some(value) => Some(Proposal {
                        original: found.to_string(),
                        replacement: value.clone(),
                        confidence: 0.95,
                    }),
                    None => Some(Proposal {
                        original: found.to_string(),
                        replacement: String::new(),
                        confidence: 0.8,
                    }),
                }
            }
            rules::ASSISTANT_DISCLAIMER => Some(Proposal {
                original: span?.to_string(),
                replacement: String::new(),
                confidence: 0.9,
            }),
            rules::REPEATED_PARAGRAPH => {
                let para = span?;
                let first = current.find(para)?;
                let after = first + para.len();
                let second = current[after..].find(para)? + after;
                // Original is the separator plus the duplicate so removal keeps spacing sane.
                let start = current[..second].trim_end().len();
                Some(Proposal {
                    original: current[start..second + para.len()].to_string(),
                    replacement: String::new(),
                    confidence: 0.9,
                })
            }
            rules::TRUNCATED_ENDING => {
                let tail = span?;
                if text::sentences(current).len() < 2 {
                    return None;
                }
                Some(Proposal {
                    original: tail.to_string(),
                    replacement: String::new(),
                    confidence: 0.8,
                })
            }
            rules::MAX_LENGTH => {
                let max = self.cfg.max_words?;
                let keep = keep_sentences_within(current, max)?;
                let tail = current[keep..].to_string();
                if tail.trim().is_empty() {
                    return None;
                }
                Some(Proposal {
                    original: tail,
                    replacement: String::new(),
                    confidence: 0.75,
                })
            }
            _ => None,
        }
    }
}

/// Replace the last occurrence for trailing spans, the first otherwise.
fn apply(current: &str, p: &Proposal) -> Option<String> {
    if p.original.is_empty() {
        return None;
    }
    let start = if current.ends_with(p.original.as_str()) {
        current.len() - p.original.len()
    } else {
        current.find(p.original.as_str())?
    };
    Some(splice(current, start, start + p.original.len(), &p.replacement))
}

/// Swap `current[start..end]` for `replacement`. A removal also cleans up the
/// seam it leaves: doubled spaces and spaces before punctuation. Text outside
/// the seam is left exactly as the model wrote it.
fn splice(current: &str, start: usize, end: usize, replacement: &str) -> String {
    let mut head = &current[..start];
    let mut tail = &current[end..];
    if replacement.is_empty() {
        if head.trim().is_empty() {
            head = "";
            tail = tail.trim_start();
        } else if tail.trim().is_empty() {
            head = head.trim_end();
            tail = "";
        } else {
            let rest = tail.trim_start_matches(' ');
            if rest.starts_with(|c: char| matches!(c, '.' | ',' | '!' | '?' | '\n')) {
                head = head.trim_end_matches(' ');
                tail = rest;
            } else if head.ends_with(' ') {
                tail = rest;
            }
        }
    }
    format!("{head}{replacement}{tail}")
}

/// Byte offset after the last whole sentence that fits in `max_words`.
fn keep_sentences_within(current: &str, max_words: usize) -> Option<usize> {
    let mut words = 0;
    let mut end = None;
    for s in text::sentences(current) {
        words += text::words(s).len();
        if words > max_words {
            break;
        }
        let offset = current.find(s)? + s.len();
        end = Some(offset.max(end.unwrap_or(0)));
    }
    end
}

fn match_case(found: &str, replacement: &str) -> String {
    let upper = found.chars().next().map_or(false, char::is_uppercase);
    if !upper {
        return replacement.to_string();
    }
    let mut chars = replacement.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
