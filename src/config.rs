//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONCIERGE__*` 覆盖（双下划线表示嵌套，如 `CONCIERGE__SESSION__LOCK_MODE=reject`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{CoordinatorSettings, LockMode};
use crate::dispatch::{AgentDescriptor, DispatchSettings};
use crate::memory::Message;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub session: SessionSection,
    pub dispatch: DispatchSection,
    pub compaction: CompactionSection,
    pub store: StoreSection,
    /// [[agents]] 节点描述；为空时使用内置的演示层级
    pub agents: Vec<AgentDescriptor>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    pub base_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// 从该环境变量读取 API Key；未设置时使用回显决策单元
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// 路由节点可单独使用的模型（如更快的小模型）
    pub router_model: Option<String>,
    #[serde(default)]
    pub router_agents: Vec<String>,
    /// 单次请求超时（秒）
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            model: default_model(),
            api_key_env: default_api_key_env(),
            router_model: None,
            router_agents: Vec::new(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

/// 种子消息（配置文件中的 [[session.seed]]）
#[derive(Debug, Clone, Deserialize)]
pub struct SeedMessage {
    pub role: String,
    pub content: String,
}

/// [session] 段：TTL、锁、超时、持久化策略
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 会话在存储中的存活时间；0 表示永不过期
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub lock_mode: LockMode,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// 整轮超时；0 表示不限
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_cas_attempts")]
    pub cas_attempts: usize,
    #[serde(default)]
    pub checkpoint_each_step: bool,
    /// 为空时使用内置种子
    #[serde(default)]
    pub seed: Vec<SeedMessage>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            lock_mode: LockMode::default(),
            lock_wait_ms: default_lock_wait_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            cas_attempts: default_cas_attempts(),
            checkpoint_each_step: false,
            seed: Vec::new(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    86_400
}

fn default_lock_wait_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_cas_attempts() -> usize {
    3
}

impl SessionSection {
    pub fn ttl(&self) -> Option<u64> {
        (self.ttl_secs > 0).then_some(self.ttl_secs)
    }

    /// 转为协调器配置；非法的种子角色被忽略
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        let defaults = CoordinatorSettings::default();
        let seed = if self.seed.is_empty() {
            defaults.seed
        } else {
            self.seed
                .iter()
                .filter_map(|m| match m.role.as_str() {
                    "user" => Some(Message::user(&m.content)),
                    "assistant" => Some(Message::assistant(&m.content)),
                    "system" => Some(Message::system(&m.content)),
                    other => {
                        tracing::warn!(role = other, "ignoring seed message with unsupported role");
                        None
                    }
                })
                .collect()
        };
        CoordinatorSettings {
            lock_mode: self.lock_mode,
            lock_wait: Duration::from_millis(self.lock_wait_ms),
            request_timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
            cas_attempts: self.cas_attempts.max(1),
            checkpoint_each_step: self.checkpoint_each_step,
            seed,
        }
    }
}

/// [dispatch] 段：入口节点、决策上限、并发、身份参数名
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_entry")]
    pub entry: String,
    #[serde(default = "default_max_decision_cycles")]
    pub max_decision_cycles: usize,
    #[serde(default = "default_max_parallel_tools")]
    pub max_parallel_tools: usize,
    /// 由网关注入、对模型隐藏的参数名
    #[serde(default = "default_identity_param")]
    pub identity_param: String,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            entry: default_entry(),
            max_decision_cycles: default_max_decision_cycles(),
            max_parallel_tools: default_max_parallel_tools(),
            identity_param: default_identity_param(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_entry() -> String {
    "gateway_agent".to_string()
}

fn default_max_decision_cycles() -> usize {
    16
}

fn default_max_parallel_tools() -> usize {
    4
}

fn default_identity_param() -> String {
    "user_id".to_string()
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl DispatchSection {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_decision_cycles: self.max_decision_cycles,
            max_parallel_tools: self.max_parallel_tools,
        }
    }
}

/// [compaction] 段：默认关闭
#[derive(Debug, Clone, Deserialize)]
pub struct CompactionSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_compaction_messages")]
    pub trigger_messages: usize,
    #[serde(default = "default_compaction_messages")]
    pub keep_messages: usize,
}

impl Default for CompactionSection {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_messages: default_compaction_messages(),
            keep_messages: default_compaction_messages(),
        }
    }
}

fn default_compaction_messages() -> usize {
    20
}

/// [store] 段：memory / sqlite
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/checkpoints.db")
}

/// 从 config 目录加载配置，环境变量 CONCIERGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONCIERGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONCIERGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.session.ttl(), Some(86_400));
        assert_eq!(cfg.dispatch.identity_param, "user_id");
        assert_eq!(cfg.store.backend, "memory");
        assert!(!cfg.compaction.enabled);
        let settings = cfg.session.coordinator_settings();
        assert_eq!(settings.lock_mode, LockMode::Queue);
        assert_eq!(settings.seed.len(), 2);
    }

    #[test]
    fn test_file_overrides_and_agents() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[session]
lock_mode = "reject"
request_timeout_secs = 0
ttl_secs = 0

[[session.seed]]
role = "assistant"
content = "您好"

[dispatch]
entry = "front"

[[agents]]
name = "front"
directive = "route"
children = ["orders"]

[[agents]]
name = "orders"
description = "order specialist"
tools = ["get_order"]
"#
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.session.lock_mode, LockMode::Reject);
        assert_eq!(cfg.session.ttl(), None);
        let settings = cfg.session.coordinator_settings();
        assert!(settings.request_timeout.is_none());
        assert_eq!(settings.seed, vec![Message::assistant("您好")]);
        assert_eq!(cfg.dispatch.entry, "front");
        assert_eq!(cfg.agents.len(), 2);
        assert_eq!(cfg.agents[1].tools, vec!["get_order".to_string()]);
        assert!(cfg.agents[0].tools.is_empty());
    }
}
