//! Testing utilities for researchflow workflows.
//!
//! This module provides:
//! - Capability doubles (scripted, echoing, blocking, slow)
//! - The standard research workflow with fast retries
//! - An orchestrator harness over an in-memory store

mod fixtures;
mod mocks;

pub use fixtures::{
    fast_retry, registry_with, research_workflow, test_config, test_orchestrator,
    RESEARCH_WORKFLOW,
};
pub use mocks::{BlockingCapability, EchoCapability, ScriptedCapability, SlowCapability};
