//! 配置模块
//!
//! 环境变量解析与服务白名单

pub mod env;
pub mod services;

pub use env::{EnvConfig, HealthSettings, ManifestPolicy, MonitorSettings};
pub use services::{ManifestLocation, ServiceMapping, ServiceRegistry, ServiceResolver};
