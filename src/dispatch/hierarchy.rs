//! 调度层级：把 AgentNode 组合成树，子节点以工具的形状暴露给父节点
//!
//! 构造时校验：入口存在、名称唯一、工具已在网关注册、子节点存在、无环、每个节点都有决策单元。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::core::DispatchError;
use crate::dispatch::{AgentDescriptor, AgentNode, Capability};
use crate::llm::Decider;
use crate::tools::{delegate_schema, CapabilitySchema, ToolGateway};

/// 单次外部请求的调度限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// 整个层级共享的决策次数上限
    pub max_decision_cycles: usize,
    /// 同一条 assistant 消息中 ToolCall 的并发解析数
    pub max_parallel_tools: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_decision_cycles: 16,
            max_parallel_tools: 4,
        }
    }
}

/// 不可变的调度层级；启动时显式构造，随后在会话间只读共享
pub struct DispatchHierarchy {
    entry: Arc<AgentNode>,
    nodes: BTreeMap<String, Arc<AgentNode>>,
    gateway: Arc<ToolGateway>,
    settings: DispatchSettings,
}

impl DispatchHierarchy {
    pub fn builder(gateway: Arc<ToolGateway>) -> HierarchyBuilder {
        HierarchyBuilder::new(gateway)
    }

    pub fn entry(&self) -> &Arc<AgentNode> {
        &self.entry
    }

    pub fn node(&self, name: &str) -> Option<&Arc<AgentNode>> {
        self.nodes.get(name)
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.gateway
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }
}

impl fmt::Debug for DispatchHierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchHierarchy")
            .field("entry", &self.entry.name())
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("tools", &self.gateway.tool_names())
            .field("settings", &self.settings)
            .finish()
    }
}

/// 层级构造器
pub struct HierarchyBuilder {
    gateway: Arc<ToolGateway>,
    descriptors: Vec<AgentDescriptor>,
    entry: Option<String>,
    default_decider: Option<Arc<dyn Decider>>,
    deciders: HashMap<String, Arc<dyn Decider>>,
    settings: DispatchSettings,
}

impl HierarchyBuilder {
    pub fn new(gateway: Arc<ToolGateway>) -> Self {
        Self {
            gateway,
            descriptors: Vec::new(),
            entry: None,
            default_decider: None,
            deciders: HashMap::new(),
            settings: DispatchSettings::default(),
        }
    }

    pub fn agent(mut self, descriptor: AgentDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn agents(mut self, descriptors: impl IntoIterator<Item = AgentDescriptor>) -> Self {
        self.descriptors.extend(descriptors);
        self
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// 未单独绑定决策单元的节点使用该默认值
    pub fn default_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.default_decider = Some(decider);
        self
    }

    /// 为某个节点绑定专用决策单元（如路由节点用更快的模型）
    pub fn decider_for(mut self, node: impl Into<String>, decider: Arc<dyn Decider>) -> Self {
        self.deciders.insert(node.into(), decider);
        self
    }

    pub fn settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<DispatchHierarchy, DispatchError> {
        let invalid = |msg: String| DispatchError::InvalidHierarchy(msg);

        let entry_name = self
            .entry
            .clone()
            .ok_or_else(|| invalid("no entry node configured".into()))?;

        let mut by_name: HashMap<&str, &AgentDescriptor> = HashMap::new();
        for d in &self.descriptors {
            if d.name.trim().is_empty() {
                return Err(invalid("agent with empty name".into()));
            }
            if by_name.insert(d.name.as_str(), d).is_some() {
                return Err(invalid(format!("duplicate agent name {}", d.name)));
            }
            if self.gateway.contains(&d.name) {
                return Err(invalid(format!("agent {} shadows a tool of the same name", d.name)));
            }
        }
        if !by_name.contains_key(entry_name.as_str()) {
            return Err(invalid(format!("entry node {entry_name} is not defined")));
        }
        for d in &self.descriptors {
            for tool in &d.tools {
                if !self.gateway.contains(tool) {
                    return Err(invalid(format!("agent {} references unknown tool {tool}", d.name)));
                }
            }
            for child in &d.children {
                if !by_name.contains_key(child.as_str()) {
                    return Err(invalid(format!("agent {} references unknown child {child}", d.name)));
                }
            }
        }

        let mut built: BTreeMap<String, Arc<AgentNode>> = BTreeMap::new();
        for d in &self.descriptors {
            let mut path = Vec::new();
            self.build_node(&d.name, &by_name, &mut path, &mut built)?;
        }
        let entry = built
            .get(&entry_name)
            .cloned()
            .ok_or_else(|| invalid(format!("entry node {entry_name} is not defined")))?;

        tracing::info!(
            entry = %entry_name,
            nodes = built.len(),
            max_decision_cycles = self.settings.max_decision_cycles,
            "dispatch hierarchy built"
        );
        Ok(DispatchHierarchy {
            entry,
            nodes: built,
            gateway: self.gateway,
            settings: DispatchSettings {
                max_decision_cycles: self.settings.max_decision_cycles.max(1),
                max_parallel_tools: self.settings.max_parallel_tools.max(1),
            },
        })
    }

    /// 自底向上构造；path 为当前递归路径，用于发现环
    fn build_node(
        &self,
        name: &str,
        by_name: &HashMap<&str, &AgentDescriptor>,
        path: &mut Vec<String>,
        built: &mut BTreeMap<String, Arc<AgentNode>>,
    ) -> Result<Arc<AgentNode>, DispatchError> {
        if let Some(node) = built.get(name) {
            return Ok(Arc::clone(node));
        }
        if path.iter().any(|p| p == name) {
            path.push(name.to_string());
            return Err(DispatchError::InvalidHierarchy(format!(
                "cycle detected: {}",
                path.join(" -> ")
            )));
        }
        let descriptor = by_name
            .get(name)
            .ok_or_else(|| DispatchError::InvalidHierarchy(format!("unknown agent {name}")))?;
        path.push(name.to_string());

        let mut capabilities = Vec::with_capacity(descriptor.tools.len() + descriptor.children.len());
        for tool in &descriptor.tools {
            let schema = self
                .gateway
                .schema(tool)
                .cloned()
                .ok_or_else(|| DispatchError::InvalidHierarchy(format!("unknown tool {tool}")))?;
            capabilities.push((schema, Capability::Leaf(tool.clone())));
        }
        for child in &descriptor.children {
            let node = self.build_node(child, by_name, path, built)?;
            let schema = CapabilitySchema {
                name: node.name().to_string(),
                description: node.descriptor().description.clone(),
                parameters: delegate_schema(),
            };
            capabilities.push((schema, Capability::Child(node)));
        }
        path.pop();

        let decider = self
            .deciders
            .get(name)
            .or(self.default_decider.as_ref())
            .cloned()
            .ok_or_else(|| DispatchError::InvalidHierarchy(format!("no decider for agent {name}")))?;
        let node = Arc::new(AgentNode::new((*descriptor).clone(), decider, capabilities));
        built.insert(name.to_string(), Arc::clone(&node));
        Ok(node)
    }
}
