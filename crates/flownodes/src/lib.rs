//! Standard step library
//!
//! Built-in steps: console output, failures, result marking, timed waits,
//! externally released semaphores and identity reporting.

mod debug;
mod identity;
pub mod semaphore;
mod time;

pub use debug::{EchoStep, ErrorStep, UnstableStep};
pub use identity::{CheckAuthStep, WhoamiStep};
pub use semaphore::{SemaphoreBoard, SemaphoreStep};
pub use time::SleepStep;

use flowruntime::StepRegistry;
use std::sync::Arc;

/// Register all standard steps with a registry
pub fn register_all(registry: &mut StepRegistry, board: &Arc<SemaphoreBoard>) {
    registry.register(Arc::new(debug::EchoStepDescriptor));
    registry.register(Arc::new(debug::ErrorStepDescriptor));
    registry.register(Arc::new(debug::UnstableStepDescriptor));
    registry.register(Arc::new(time::SleepStepDescriptor));
    registry.register(Arc::new(semaphore::SemaphoreStepDescriptor::new(Arc::clone(board))));
    registry.register(Arc::new(identity::WhoamiStepDescriptor));
    registry.register(Arc::new(identity::CheckAuthStepDescriptor));
}

/// A registry holding every standard step.
pub fn standard_registry(board: &Arc<SemaphoreBoard>) -> StepRegistry {
    let mut registry = StepRegistry::new();
    register_all(&mut registry, board);
    registry
}
