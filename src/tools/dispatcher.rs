//! Function-call dispatch with exactly-once results per `call_id`.

use crate::error::VoiceError;
use crate::tools::call::{AmbientContext, FunctionCallRequest, FunctionCallResult};
use crate::tools::registry::ToolRegistry;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A finished call, tagged with the session generation that started it.
#[derive(Debug)]
pub struct DispatchOutcome {
    generation: u64,
    result: FunctionCallResult,
}

impl DispatchOutcome {
    pub fn result(&self) -> &FunctionCallResult {
        &self.result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    Started,
    /// The `call_id` is already in flight or answered.
    Duplicate,
}

pub struct FunctionCallDispatcher {
    registry: ToolRegistry,
    timeout: Duration,
    ambient: Option<AmbientContext>,
    outcome_tx: mpsc::UnboundedSender<DispatchOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<DispatchOutcome>,
    in_flight: HashMap<String, Option<JoinHandle<()>>>,
    answered: HashSet<String>,
    generation: u64,
}

impl FunctionCallDispatcher {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            timeout,
            ambient: None,
            outcome_tx,
            outcome_rx,
            in_flight: HashMap::new(),
            answered: HashSet::new(),
            generation: 0,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Bind subsequent calls to a new session. Anything still running is abandoned.
    pub fn begin_session(&mut self, ambient: AmbientContext) {
        self.abandon_all();
        self.ambient = Some(ambient);
    }

    /// Start a call. The result arrives later through [`next_outcome`](Self::next_outcome).
    pub fn dispatch(&mut self, request: FunctionCallRequest) -> DispatchDecision {
        if self.in_flight.contains_key(&request.call_id) || self.answered.contains(&request.call_id)
        {
            tracing::debug!(call_id = %request.call_id, "Ignoring duplicate function call");
            return DispatchDecision::Duplicate;
        }

        let call_id = request.call_id.clone();
        let generation = self.generation;

        let resolved = match (&self.ambient, self.registry.get(&request.tool_name)) {
            (None, _) => Err("no active session".to_string()),
            (Some(_), None) => Err(format!("unknown tool: {}", request.tool_name)),
            (Some(ambient), Some(handler)) => Ok((ambient.clone(), handler)),
        };

        let (ambient, handler) = match resolved {
            Ok(pair) => pair,
            Err(message) => {
                tracing::warn!(call_id = %call_id, tool = %request.tool_name, "{}", message);
                self.in_flight.insert(call_id, None);
                self.send(DispatchOutcome {
                    generation,
                    result: FunctionCallResult::error(&request, message),
                });
                return DispatchDecision::Started;
            }
        };

        tracing::info!(call_id = %call_id, tool = %request.tool_name, "Dispatching function call");

        let timeout = self.timeout;
        let tx = self.outcome_tx.clone();
        let task = tokio::spawn(async move {
            let call = AssertUnwindSafe(handler.invoke(request.arguments.clone(), &ambient))
                .catch_unwind();
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(Ok(value))) => FunctionCallResult::success(&request, value),
                Ok(Ok(Err(e))) => {
                    tracing::warn!(call_id = %request.call_id, error = %e, "Tool handler failed");
                    FunctionCallResult::error(&request, error_message(e))
                }
                Ok(Err(_)) => {
                    tracing::error!(call_id = %request.call_id, "Tool handler panicked");
                    FunctionCallResult::error(&request, "handler panicked")
                }
                Err(_) => {
                    tracing::warn!(
                        call_id = %request.call_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Tool handler timed out"
                    );
                    FunctionCallResult::error(
                        &request,
                        format!("timed out after {}ms", timeout.as_millis()),
                    )
                }
            };
            if tx.send(DispatchOutcome { generation, result }).is_err() {
                tracing::trace!("Dispatcher dropped before outcome was delivered");
            }
        });

        self.in_flight.insert(call_id, Some(task));
        DispatchDecision::Started
    }

    fn send(&self, outcome: DispatchOutcome) {
        if self.outcome_tx.send(outcome).is_err() {
            tracing::trace!("Outcome channel closed");
        }
    }

    /// Wait for the next finished call. Pends forever when nothing is running.
    pub async fn next_outcome(&mut self) -> DispatchOutcome {
        match self.outcome_rx.recv().await {
            Some(outcome) => outcome,
            // The sender lives in self, so the channel never closes.
            None => std::future::pending().await,
        }
    }

    /// Accept an outcome for injection.
    ///
    /// Returns `None` for outcomes of an abandoned session or an unknown call;
    /// those must not reach the event channel.
    pub fn complete(&mut self, outcome: DispatchOutcome) -> Option<FunctionCallResult> {
        if outcome.generation != self.generation {
            tracing::debug!(
                call_id = %outcome.result.call_id,
                "Discarding result of abandoned function call"
            );
            return None;
        }
        self.in_flight.remove(&outcome.result.call_id)?;
        self.answered.insert(outcome.result.call_id.clone());
        Some(outcome.result)
    }

    /// Number of calls started but not yet completed.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Abort running calls; their late outcomes are discarded.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.in_flight.len();
        for (call_id, task) in self.in_flight.drain() {
            if let Some(task) = task {
                task.abort();
            }
            tracing::debug!(call_id = %call_id, "Abandoned function call");
        }
        self.answered.clear();
        self.ambient = None;
        self.generation += 1;
        count
    }
}

impl Drop for FunctionCallDispatcher {
    fn drop(&mut self) {
        for task in self.in_flight.values().flatten() {
            task.abort();
        }
    }
}

fn error_message(error: VoiceError) -> String {
    match error {
        VoiceError::ToolDispatch { message, .. } => message,
        other => other.to_string(),
    }
}
