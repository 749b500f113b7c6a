//! Request pipeline: safety gate, then execution gate, then the engine.

use crate::config::WeaverConfig;
use crate::engine::{new_request_id, WorkflowEngine, WorkflowResponse};
use crate::errors::{GateResult, WeaverResult};
use crate::gate::{Backoff, ExecutionGate};
use crate::safety::SafetyGate;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// The gates and the engine, wired in request order.
#[derive(Clone)]
pub struct Pipeline {
    safety: SafetyGate,
    gate: Arc<ExecutionGate>,
    engine: Arc<WorkflowEngine>,
    backoff: Backoff,
}

impl Pipeline {
    pub fn new(safety: SafetyGate, gate: Arc<ExecutionGate>, engine: Arc<WorkflowEngine>) -> Self {
        Self {
            safety,
            gate,
            engine,
            backoff: Backoff::default(),
        }
    }

    /// Build every stage of the pipeline from configuration.
    pub async fn from_config(config: &WeaverConfig) -> WeaverResult<Self> {
        let engine = WorkflowEngine::from_config(config)?;
        let gate = ExecutionGate::from_config(&config.gate).await?;
        let safety = SafetyGate::from_config(&config.safety)?;

        Ok(Self::new(safety, Arc::new(gate), Arc::new(engine))
            .with_backoff(Backoff::from_config(&config.gate.backoff)))
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn safety(&self) -> &SafetyGate {
        &self.safety
    }

    pub fn gate(&self) -> &Arc<ExecutionGate> {
        &self.gate
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Run one request, rejecting it immediately when unsafe or when another run holds the lease.
    pub async fn run(
        &self,
        input: &str,
        conversation_id: Option<&str>,
        input_images: Vec<PathBuf>,
    ) -> GateResult<WorkflowResponse> {
        self.safety.check(input)?;
        self.run_gated(input, conversation_id, input_images).await
    }

    /// Like [`Pipeline::run`], but waits out busy rejections with exponential backoff.
    pub async fn run_with_backoff(
        &self,
        input: &str,
        conversation_id: Option<&str>,
        input_images: Vec<PathBuf>,
    ) -> GateResult<WorkflowResponse> {
        self.safety.check(input)?;
        self.backoff
            .retry(move || self.run_gated(input, conversation_id, input_images.clone()))
            .await
    }

    async fn run_gated(
        &self,
        input: &str,
        conversation_id: Option<&str>,
        input_images: Vec<PathBuf>,
    ) -> GateResult<WorkflowResponse> {
        let request_id = new_request_id();
        debug!(request_id = %request_id, "Requesting execution lease");

        // Not polled until the lease is held, so a busy rejection creates no state.
        let run = self
            .engine
            .run_with_id(request_id.clone(), input, conversation_id, input_images);
        self.gate.run_exclusive(&request_id, run).await
    }
}
