//! Render pipeline - orchestration state machine and render persistence

pub mod orchestrator;
pub mod store;

pub use orchestrator::{checkpoints, GenerationOrchestrator, PipelineComponents};
pub use store::{InMemoryRenderStore, RenderRecord, RenderStore, RenderUpdate};
