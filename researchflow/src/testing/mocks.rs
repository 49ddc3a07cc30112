//! Capability doubles for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::capability::{Capability, CapabilityInput, CapabilityKind};
use crate::errors::CapabilityError;

type Outcome = Result<Value, CapabilityError>;

/// A capability that replays a script of outcomes, then a fallback.
///
/// Records every input it receives.
#[derive(Debug)]
pub struct ScriptedCapability {
    kind: CapabilityKind,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Option<Outcome>>,
    inputs: Mutex<Vec<CapabilityInput>>,
}

impl ScriptedCapability {
    /// Creates a capability that echoes its stage until scripted otherwise.
    #[must_use]
    pub fn new(kind: CapabilityKind) -> Self {
        Self {
            kind,
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Creates a capability that fails every call with `error`.
    #[must_use]
    pub fn failing(kind: CapabilityKind, error: CapabilityError) -> Self {
        Self::new(kind).with_fallback(Err(error))
    }

    /// Queues a successful outcome.
    #[must_use]
    pub fn then_ok(self, output: Value) -> Self {
        self.script.lock().push_back(Ok(output));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn then_err(self, error: CapabilityError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Sets the outcome used once the script is exhausted.
    #[must_use]
    pub fn with_fallback(self, outcome: Result<Value, CapabilityError>) -> Self {
        *self.fallback.lock() = Some(outcome);
        self
    }

    /// Number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Inputs of every call, in call order.
    #[must_use]
    pub fn recorded_inputs(&self) -> Vec<CapabilityInput> {
        self.inputs.lock().clone()
    }

    /// Stage identifiers of every call, in call order.
    #[must_use]
    pub fn called_stages(&self) -> Vec<String> {
        self.inputs.lock().iter().map(|i| i.stage_id.clone()).collect()
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    fn kind(&self) -> CapabilityKind {
        self.kind.clone()
    }

    async fn invoke(&self, input: CapabilityInput, _cancel: CancellationToken) -> Outcome {
        let stage_id = input.stage_id.clone();
        self.inputs.lock().push(input);
        if let Some(outcome) = self.script.lock().pop_front() {
            return outcome;
        }
        self.fallback
            .lock()
            .clone()
            .unwrap_or_else(|| Ok(json!({ "stage": stage_id })))
    }
}

/// A capability that succeeds with a summary of its input.
#[derive(Debug)]
pub struct EchoCapability {
    kind: CapabilityKind,
    delay: Duration,
}

impl EchoCapability {
    /// Creates an echo capability.
    #[must_use]
    pub fn new(kind: CapabilityKind) -> Self {
        Self {
            kind,
            delay: Duration::ZERO,
        }
    }

    /// Makes every call take `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Capability for EchoCapability {
    fn kind(&self) -> CapabilityKind {
        self.kind.clone()
    }

    async fn invoke(&self, input: CapabilityInput, cancel: CancellationToken) -> Outcome {
        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = cancel.cancelled() => return Err(CapabilityError::permanent("cancelled")),
            }
        }
        Ok(json!({
            "agent": self.kind.to_string(),
            "stage": input.stage_id,
            "attempt": input.attempt,
            "query": input.request_str("query"),
            "upstream": input.upstream.keys().collect::<Vec<_>>(),
        }))
    }
}

/// A capability that blocks until its task is cancelled.
#[derive(Debug)]
pub struct BlockingCapability {
    kind: CapabilityKind,
    started: AtomicUsize,
    entered: tokio::sync::Notify,
}

impl BlockingCapability {
    /// Creates a blocking capability.
    #[must_use]
    pub fn new(kind: CapabilityKind) -> Self {
        Self {
            kind,
            started: AtomicUsize::new(0),
            entered: tokio::sync::Notify::new(),
        }
    }

    /// Number of calls that have started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Waits until at least one call has started.
    pub async fn wait_started(&self) {
        loop {
            let notified = self.entered.notified();
            if self.started() > 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Capability for BlockingCapability {
    fn kind(&self) -> CapabilityKind {
        self.kind.clone()
    }

    async fn invoke(&self, _input: CapabilityInput, cancel: CancellationToken) -> Outcome {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_waiters();
        cancel.cancelled().await;
        Err(CapabilityError::permanent(
            cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
        ))
    }
}

/// A capability that ignores cancellation and sleeps before succeeding.
#[derive(Debug)]
pub struct SlowCapability {
    kind: CapabilityKind,
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowCapability {
    /// Creates a slow capability.
    #[must_use]
    pub fn new(kind: CapabilityKind, delay: Duration) -> Self {
        Self {
            kind,
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for SlowCapability {
    fn kind(&self) -> CapabilityKind {
        self.kind.clone()
    }

    async fn invoke(&self, input: CapabilityInput, _cancel: CancellationToken) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(json!({ "stage": input.stage_id, "late": true }))
    }
}
