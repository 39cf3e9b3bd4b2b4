//! 运行时状态模块
//!
//! 管理应用状态、部署记录和事件通道

pub mod app_state;
pub mod event_hub;
pub mod task_store;

pub use app_state::AppState;
pub use event_hub::{DeployEvent, EventHub};
pub use task_store::{AdmitError, TaskStore};
