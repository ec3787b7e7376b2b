//! 调度层：节点描述、能力变体、层级组合

pub mod hierarchy;
pub mod node;

pub use hierarchy::{DispatchHierarchy, DispatchSettings, HierarchyBuilder};
pub use node::{AgentDescriptor, AgentNode, Capability};
