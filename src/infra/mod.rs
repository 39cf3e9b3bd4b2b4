//! 基础设施模块
//!
//! 封装外部依赖（集群 API、仓库令牌、源码托管平台、回调通知）

pub mod cluster;
pub mod notifier;
pub mod registry;
pub mod source_control;

pub use cluster::{ClusterApi, ClusterError, SwarmClient};
pub use notifier::{CallbackNotifier, FanoutSink, PipelineEventSink};
pub use registry::{HttpTokenIssuer, IssuedToken, RegistryError, RegistryTokenApi};
pub use source_control::{CommitInfo, GitLabClient, RepoFile, SourceControlApi, SourceControlError};
