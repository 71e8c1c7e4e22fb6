//! Next-step routing

use crate::models::workflow::{ExecutionState, WorkflowDefinition};
use crate::workflow::classifier::{ContentClassifier, KeywordClassifier};
use std::sync::Arc;

/// Routing decision taken after every handler call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Step(String),
    Terminal,
}

/// Pure router with fixed precedence:
/// escalation, then explicit `next_step`, then classification / default step.
#[derive(Clone)]
pub struct Router {
    classifier: Arc<dyn ContentClassifier>,
}

impl Router {
    pub fn new(classifier: Arc<dyn ContentClassifier>) -> Self {
        Self { classifier }
    }

    pub fn route(&self, state: &ExecutionState, workflow: &WorkflowDefinition) -> Route {
        let valid = |step_id: &String| workflow.has_step(step_id);

        if state.escalate {
            return workflow
                .escalation_step
                .clone()
                .filter(valid)
                .map(Route::Step)
                .unwrap_or(Route::Terminal);
        }

        if let Some(next) = state.next_step.clone().filter(valid) {
            return Route::Step(next);
        }

        let Some(step) = workflow.step(&state.current_step) else {
            return Route::Terminal;
        };

        if step.classify {
            let target = self
                .classifier
                .classify(state)
                .and_then(|category| workflow.category_routes.get(&category).cloned())
                .filter(valid);
            if let Some(target) = target {
                return Route::Step(target);
            }
        }

        step.default_next
            .clone()
            .filter(valid)
            .map(Route::Step)
            .unwrap_or(Route::Terminal)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(Arc::new(KeywordClassifier::default()))
    }
}
