use quill_types::{ModelTier, RouteDecision, RouteState, RouteStrategy};

use crate::StrategyPlan;

/// Accumulates the state-machine transitions of one request.
///
/// Sealed into a `RouteDecision` exactly once at the end of the request.
#[derive(Clone, Debug, Default)]
pub struct RouteTrace {
    transitions: Vec<RouteState>,
    fell_back: bool,
}

impl RouteTrace {
    pub fn new() -> Self {
        Self {
            transitions: vec![RouteState::Start],
            fell_back: false,
        }
    }

    pub fn enter(&mut self, state: RouteState) {
        if state == RouteState::FallbackBigModel {
            self.fell_back = true;
        }
        self.transitions.push(state);
    }

    pub fn fell_back(&self) -> bool {
        self.fell_back
    }

    pub fn transitions(&self) -> &[RouteState] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<RouteState> {
        self.transitions
    }

    /// Final decision for a model-served request, reflecting what actually ran.
    pub fn seal(self, plan: &StrategyPlan) -> RouteDecision {
        let strategy = match plan.first {
            ModelTier::Big => RouteStrategy::BigModel,
            ModelTier::Small if self.fell_back => RouteStrategy::SmallWithFallback,
            ModelTier::Small => RouteStrategy::SmallModel,
        };
        let rationale = if self.fell_back {
            format!("{}; escalated to big model after small-model failure", plan.rationale)
        } else {
            plan.rationale.clone()
        };
        RouteDecision {
            strategy,
            rationale,
            score: plan.score,
            confidence: plan.confidence,
            top_features: plan.top_features.clone(),
            transitions: self.transitions,
        }
    }
}
