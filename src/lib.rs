//! Concierge - 对话式调度网关
//!
//! 模块划分：
//! - **agent**: 运行时装配（配置 -> 工具网关 -> 调度层级 -> 会话协调器）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、身份、会话锁、恢复检查、会话协调器
//! - **dispatch**: 智能体节点与调度层级（子节点以工具形式暴露给父节点）
//! - **gateway**: HTTP 接口（需要 `server` feature）
//! - **llm**: 决策单元抽象与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **memory**: 消息模型、会话日志与配对检查、历史压缩
//! - **react**: 单节点的决策-执行循环
//! - **store**: 带版本与 TTL 的检查点存储（内存 / SQLite）
//! - **tools**: 工具注册表、身份注入网关与演示工具

pub mod agent;
pub mod config;
pub mod core;
pub mod dispatch;
#[cfg(feature = "server")]
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod store;
pub mod tools;

pub use crate::core::{DispatchError, Identity, SessionCoordinator};
