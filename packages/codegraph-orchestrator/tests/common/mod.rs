//! Shared helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use codegraph_orchestrator::{
    RetryPolicy, StageContext, StageError, StageHandler, StageId, StageInput, StageMetrics,
    StageNode, StageOutput,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Execution log shared by every recording stage of a test
#[derive(Clone, Default)]
pub struct Recorder {
    order: Arc<Mutex<Vec<String>>>,
    inputs: Arc<Mutex<HashMap<String, Vec<PathBuf>>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    pub fn calls(&self, stage: &str) -> usize {
        self.order.lock().iter().filter(|s| *s == stage).count()
    }

    /// Files the stage was asked to process on its last invocation
    pub fn processed(&self, stage: &str) -> Vec<PathBuf> {
        self.inputs.lock().get(stage).cloned().unwrap_or_default()
    }

    pub fn stage(&self, id: &str) -> RecordingStage {
        RecordingStage {
            id: StageId::new(id),
            recorder: self.clone(),
            delay: Duration::ZERO,
            behavior: Behavior::Succeed,
        }
    }
}

#[derive(Clone)]
pub enum Behavior {
    Succeed,
    FailPermanent,
    /// Fail with a transient error this many times, then succeed
    FailTransient(usize),
    Panic,
    /// Wait at the barrier; fails unless all parties arrive
    Rendezvous(Arc<tokio::sync::Barrier>),
}

pub struct RecordingStage {
    id: StageId,
    recorder: Recorder,
    delay: Duration,
    behavior: Behavior,
}

impl RecordingStage {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }
}

#[async_trait]
impl StageHandler for RecordingStage {
    fn stage_id(&self) -> StageId {
        self.id.clone()
    }

    async fn execute(
        &self,
        input: StageInput,
        _ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let call = {
            let mut order = self.recorder.order.lock();
            order.push(self.id.to_string());
            order.iter().filter(|s| s.as_str() == self.id.as_str()).count()
        };
        self.recorder
            .inputs
            .lock()
            .insert(self.id.to_string(), input.files_to_process());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.behavior {
            Behavior::Succeed => {}
            Behavior::FailPermanent => return Err(StageError::permanent("malformed input")),
            Behavior::FailTransient(times) if call <= *times => {
                return Err(StageError::transient("connection reset"));
            }
            Behavior::FailTransient(_) => {}
            Behavior::Panic => panic!("handler bug"),
            Behavior::Rendezvous(barrier) => {
                if tokio::time::timeout(Duration::from_secs(2), barrier.wait())
                    .await
                    .is_err()
                {
                    return Err(StageError::permanent("sibling never arrived"));
                }
            }
        }

        let mut deps: Vec<&StageId> = input.dependencies.keys().collect();
        deps.sort();
        let data = format!(
            "{}<-[{}]",
            self.id,
            deps.iter().map(|d| d.as_str()).collect::<Vec<_>>().join(",")
        );

        Ok(StageOutput {
            data: data.into_bytes(),
            metrics: StageMetrics {
                files_processed: input.files_to_process().len(),
                items_created: 1,
                ..Default::default()
            },
        })
    }
}

pub fn stage(id: &str, deps: &[&str]) -> StageNode {
    StageNode::new(
        StageId::new(id),
        id.to_uppercase(),
        deps.iter().map(|d| StageId::new(*d)).collect(),
        false,
        5_000,
    )
}

pub fn optional_stage(id: &str, deps: &[&str]) -> StageNode {
    let mut node = stage(id, deps);
    node.optional = true;
    node
}

/// Fast retries so tests don't sleep for seconds
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 10,
    }
}
