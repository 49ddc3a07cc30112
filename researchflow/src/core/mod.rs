//! Core domain model types for researchflow.
//!
//! This module contains the fundamental types shared by every component:
//! - Task and stage status enums with their state machines
//! - Task identifiers
//! - Progress events

mod event;
mod ids;
mod status;

pub use event::{Event, EventKind};
pub use ids::TaskId;
pub use status::{StageStatus, TaskStatus};
