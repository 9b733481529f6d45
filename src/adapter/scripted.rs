//! Scripted adapter: deterministic in-process stand-in for the platform.
//!
//! Plays back a queue of outcomes and records every request it saw. Used by
//! tests and by offline rehearsals where no platform credentials exist.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::{AdapterOutcome, AdsApiAdapter, MutationRequest};

#[derive(Default)]
pub struct ScriptedAdapter {
    outcomes: Mutex<VecDeque<AdapterOutcome>>,
    requests: Mutex<Vec<MutationRequest>>,
}

impl ScriptedAdapter {
    /// With an empty script every call acknowledges.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(outcomes: impl IntoIterator<Item = AdapterOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_outcome(&self, outcome: AdapterOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Requests observed so far, in call order.
    pub fn requests(&self) -> Vec<MutationRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl AdsApiAdapter for ScriptedAdapter {
    async fn apply(&self, request: &MutationRequest) -> AdapterOutcome {
        self.requests.lock().push(request.clone());
        self.outcomes.lock().pop_front().unwrap_or(AdapterOutcome::Ok {
            platform_ack: format!("{}:{}", request.resource, request.entity_id),
        })
    }
}
