//! 服务层模块
//!
//! 部署引擎的各个组件与编排

pub mod credential;
pub mod deploy;
pub mod health;
pub mod image_sync;
pub mod manifest;
pub mod pipeline_monitor;
pub mod service_updater;
