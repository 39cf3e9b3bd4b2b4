//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod cluster;
pub mod deploy;
pub mod pipeline;
pub mod registry;

// Re-exports for convenience
pub use cluster::{ClusterNode, ClusterTask, ImageRef, NodeImage, NodeRole, NodeState, ServiceSpec, TaskState};
pub use deploy::{
    DeployStatus, DeployTask, DeploymentOutcome, FailedTask, HealthState, HealthStatus,
    ImagePullOutcome, ManifestCommit, PullStatus, SyncReport,
};
pub use pipeline::{PipelineEvent, PipelineEventKind, PipelineInfo, PipelineObservation, PipelineStatus};
pub use registry::RegistryCredential;
