//! Closure-backed capability adapter.

use super::{Capability, CapabilityInput, CapabilityKind};
use crate::cancellation::CancellationToken;
use crate::errors::CapabilityError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

/// A capability backed by an async closure.
///
/// Handy for wiring agents that live behind a plain function, and for tests.
pub struct FnCapability<F, Fut>
where
    F: Fn(CapabilityInput, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, CapabilityError>> + Send,
{
    kind: CapabilityKind,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnCapability<F, Fut>
where
    F: Fn(CapabilityInput, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, CapabilityError>> + Send,
{
    /// Creates a new closure-backed capability.
    pub fn new(kind: CapabilityKind, func: F) -> Self {
        Self {
            kind,
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnCapability<F, Fut>
where
    F: Fn(CapabilityInput, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, CapabilityError>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCapability")
            .field("kind", &self.kind)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> Capability for FnCapability<F, Fut>
where
    F: Fn(CapabilityInput, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, CapabilityError>> + Send,
{
    fn kind(&self) -> CapabilityKind {
        self.kind.clone()
    }

    async fn invoke(
        &self,
        input: CapabilityInput,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, CapabilityError> {
        (self.func)(input, cancel).await
    }
}
