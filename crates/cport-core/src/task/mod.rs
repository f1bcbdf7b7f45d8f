//! Async state machine engine
//!
//! - `flags` - flag bits and derived `TaskState`
//! - `cell` - task record, `Machine` contract, step results
//! - `engine` - the driver

pub mod cell;
pub mod engine;
pub mod flags;

pub use cell::{IoResult, Machine, Step, TaskCell, TaskHandle, TaskId};
pub use engine::{AwaitRejectPolicy, Engine, EngineConfig, EngineStats, KillOutcome, StepCx};
pub use flags::{TaskEnd, TaskState};
