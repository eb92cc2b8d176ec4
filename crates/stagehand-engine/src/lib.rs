//! Stage orchestration for stagehand.
//!
//! Builds the resource list of a stage, orders it by declared requirements
//! and drives deploy, frontend upload and destroy.

pub mod order;
pub mod orchestrator;

pub use order::{destroy_order, topological_sort};
pub use orchestrator::{
    DeployAction, DeployEvent, DeployReport, DestroyPlan, DestroyReport, Orchestrator,
    resource_list, stage_builder,
};
