//! 智能体节点：静态描述 + 可达能力（叶子工具 / 子节点）
//!
//! 构造后不可变，可在并发会话间只读共享。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::Decider;
use crate::tools::CapabilitySchema;

/// 节点静态配置（对应配置文件中的 [[agents]]）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    /// 作为子节点被父节点看到时的描述
    #[serde(default)]
    pub description: String,
    /// 指令文本，对调度核心不透明
    #[serde(default)]
    pub directive: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub children: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            directive: String::new(),
            tools: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = directive.into();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }
}

/// 可调用能力：叶子工具（经 ToolGateway）或子节点（递归 turn loop）
#[derive(Clone)]
pub enum Capability {
    Leaf(String),
    Child(Arc<AgentNode>),
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Leaf(name) => f.debug_tuple("Leaf").field(name).finish(),
            Capability::Child(node) => f.debug_tuple("Child").field(&node.name()).finish(),
        }
    }
}

/// 智能体节点
pub struct AgentNode {
    descriptor: AgentDescriptor,
    decider: Arc<dyn Decider>,
    capabilities: BTreeMap<String, Capability>,
    /// 决策单元可见的能力（工具在前，子节点在后，按声明顺序）
    schemas: Vec<CapabilitySchema>,
}

impl AgentNode {
    pub(crate) fn new(
        descriptor: AgentDescriptor,
        decider: Arc<dyn Decider>,
        capabilities: Vec<(CapabilitySchema, Capability)>,
    ) -> Self {
        let mut map = BTreeMap::new();
        let mut schemas = Vec::with_capacity(capabilities.len());
        for (schema, capability) in capabilities {
            map.insert(schema.name.clone(), capability);
            schemas.push(schema);
        }
        Self {
            descriptor,
            decider,
            capabilities: map,
            schemas,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn directive(&self) -> &str {
        &self.descriptor.directive
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn decider(&self) -> &Arc<dyn Decider> {
        &self.decider
    }

    /// 按名称查找可达能力
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }

    pub fn schemas(&self) -> &[CapabilitySchema] {
        &self.schemas
    }

    pub fn children(&self) -> impl Iterator<Item = &Arc<AgentNode>> {
        self.capabilities.values().filter_map(|c| match c {
            Capability::Child(node) => Some(node),
            Capability::Leaf(_) => None,
        })
    }
}

impl fmt::Debug for AgentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentNode")
            .field("name", &self.descriptor.name)
            .field("capabilities", &self.capabilities.keys().collect::<Vec<_>>())
            .finish()
    }
}
