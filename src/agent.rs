//! 运行时装配
//!
//! 从 AppConfig 显式构造：演示工具 -> ToolGateway（隐藏身份参数）-> DispatchHierarchy -> SessionCoordinator。
//! 没有进程级全局状态，重新初始化即重新构造。

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, LlmSection};
use crate::core::{DispatchError, SessionCoordinator};
use crate::dispatch::{AgentDescriptor, DispatchHierarchy};
use crate::llm::{Decider, EchoDecider, OpenAiDecider};
use crate::memory::{Compactor, DeciderSummarizer};
use crate::store::{create_checkpoint_store, CheckpointStore};
use crate::tools::{demo_registry, OrderBook, ToolGateway, ToolRegistry};

/// 内置演示层级：gateway_agent -> manager_agent -> {order_agent, product_agent}
pub fn default_agents() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new("gateway_agent", "客服入口")
            .with_directive(
                "你是电商客服入口。闲聊直接回答；订单、商品、售后问题交给 manager_agent，\
                 并把用户原话和已知的订单号、商品名完整写进 task。",
            )
            .with_children(["manager_agent"]),
        AgentDescriptor::new("manager_agent", "客服主管：分派订单与商品问题，回答售后政策")
            .with_directive(
                "根据问题类型选择专员：订单查询、取消、退款交给 order_agent；商品咨询交给 product_agent；\
                 售后政策用 get_policy 查询。汇总专员结果后给出简洁答复。",
            )
            .with_tools(["get_policy"])
            .with_children(["order_agent", "product_agent"]),
        AgentDescriptor::new("order_agent", "订单专员：查询订单、判断能否取消、提交退款")
            .with_directive(
                "处理订单相关任务。退款前先用 check_cancelable 确认，只有允许取消时才调用 refund_order。",
            )
            .with_tools(["get_order", "check_cancelable", "refund_order"]),
        AgentDescriptor::new("product_agent", "商品专员：检索商品、查询商品详情与库存")
            .with_directive(
                "按关键词、分类或价格上限用 search_products 检索；具体商品的详情用 get_product_info，价格与库存用 get_product_basic_info。",
            )
            .with_tools(["search_products", "get_product_info", "get_product_basic_info"]),
    ]
}

/// 注册表中的全部工具以配置的身份参数名接入网关
pub fn build_gateway(cfg: &AppConfig, registry: &ToolRegistry) -> ToolGateway {
    let mut gateway = ToolGateway::new(cfg.dispatch.tool_timeout_secs);
    gateway.register_all(registry, &cfg.dispatch.identity_param);
    gateway
}

/// 按配置构造层级；[[agents]] 为空时使用内置层级。router 绑定到 llm.router_agents 中的节点。
pub fn build_hierarchy(
    cfg: &AppConfig,
    gateway: Arc<ToolGateway>,
    decider: Arc<dyn Decider>,
    router: Option<Arc<dyn Decider>>,
) -> Result<DispatchHierarchy, DispatchError> {
    let agents = if cfg.agents.is_empty() {
        default_agents()
    } else {
        cfg.agents.clone()
    };
    let mut builder = DispatchHierarchy::builder(gateway)
        .agents(agents)
        .entry(cfg.dispatch.entry.clone())
        .default_decider(decider)
        .settings(cfg.dispatch.settings());
    if let Some(router) = router {
        for name in &cfg.llm.router_agents {
            builder = builder.decider_for(name.clone(), Arc::clone(&router));
        }
    }
    builder.build()
}

/// OpenAI 兼容决策单元；未配置 API Key 时退回回显决策单元
pub fn create_decider(llm: &LlmSection, model: &str) -> Result<Arc<dyn Decider>, DispatchError> {
    match std::env::var(&llm.api_key_env).ok().filter(|k| !k.trim().is_empty()) {
        Some(key) => {
            let decider = OpenAiDecider::new(
                llm.base_url.as_deref(),
                model,
                Some(&key),
                Duration::from_secs(llm.timeout_secs),
            )?;
            tracing::info!(model, "using OpenAI-compatible decider");
            Ok(Arc::new(decider))
        }
        None => {
            tracing::warn!(env = %llm.api_key_env, "API key not set, using echo decider");
            Ok(Arc::new(EchoDecider))
        }
    }
}

/// 用给定的存储与决策单元装配协调器（演示工具使用新的内存订单簿）
pub fn assemble_coordinator(
    cfg: &AppConfig,
    store: Arc<dyn CheckpointStore>,
    decider: Arc<dyn Decider>,
    router: Option<Arc<dyn Decider>>,
) -> Result<SessionCoordinator, DispatchError> {
    let registry = demo_registry(OrderBook::sample());
    let gateway = Arc::new(build_gateway(cfg, &registry));
    let hierarchy = Arc::new(build_hierarchy(cfg, gateway, Arc::clone(&decider), router)?);
    let mut coordinator =
        SessionCoordinator::new(store, hierarchy, cfg.session.coordinator_settings());
    if cfg.compaction.enabled {
        coordinator = coordinator.with_compactor(Compactor::new(
            Arc::new(DeciderSummarizer::new(decider)),
            cfg.compaction.trigger_messages,
            cfg.compaction.keep_messages,
        ));
    }
    Ok(coordinator)
}

/// 从配置创建完整的协调器：存储后端、决策单元、层级
pub async fn create_coordinator(cfg: &AppConfig) -> Result<SessionCoordinator, DispatchError> {
    let store = create_checkpoint_store(&cfg.store, cfg.session.ttl()).await;
    let decider = create_decider(&cfg.llm, &cfg.llm.model)?;
    let router = match &cfg.llm.router_model {
        Some(model) => Some(create_decider(&cfg.llm, model)?),
        None => None,
    };
    assemble_coordinator(cfg, store, decider, router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Identity;
    use crate::llm::{Decision, ScriptedDecider};
    use crate::memory::ToolCall;
    use crate::store::MemoryCheckpointStore;
    use serde_json::json;

    #[test]
    fn test_default_hierarchy_builds() {
        let cfg = AppConfig::default();
        let registry = demo_registry(OrderBook::sample());
        let gateway = Arc::new(build_gateway(&cfg, &registry));
        let h = build_hierarchy(&cfg, gateway, Arc::new(EchoDecider), None).unwrap();
        assert_eq!(h.entry().name(), "gateway_agent");
        let manager = h.node("manager_agent").unwrap();
        let names: Vec<&str> = manager.schemas().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["get_policy", "order_agent", "product_agent"]);
        let product = h.node("product_agent").unwrap();
        let names: Vec<&str> = product.schemas().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["search_products", "get_product_info", "get_product_basic_info"]);
    }

    #[tokio::test]
    async fn test_router_decider_bound_to_named_nodes() {
        let mut cfg = AppConfig::default();
        cfg.llm.router_agents = vec!["gateway_agent".into()];
        let router = Arc::new(ScriptedDecider::new().push("gateway_agent", Decision::answer("routed")));
        let main = Arc::new(ScriptedDecider::new());
        let coordinator = assemble_coordinator(
            &cfg,
            Arc::new(MemoryCheckpointStore::default()),
            main.clone(),
            Some(router.clone()),
        )
        .unwrap();
        let answer = coordinator.post_turn("u1", &Identity::new("1"), "你好").await.unwrap();
        assert_eq!(answer, "routed");
        assert_eq!(router.calls_for("gateway_agent"), 1);
        assert!(main.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_full_delegation_chain_refunds_own_order() {
        let cfg = AppConfig::default();
        let decider = Arc::new(
            ScriptedDecider::new()
                .push(
                    "gateway_agent",
                    Decision::call(vec![ToolCall::from_json("g1", "manager_agent", json!({"task": "取消订单 A1004"}))]),
                )
                .push(
                    "manager_agent",
                    Decision::call(vec![ToolCall::from_json("m1", "order_agent", json!({"task": "取消订单 A1004"}))]),
                )
                .push(
                    "order_agent",
                    Decision::call(vec![ToolCall::from_json(
                        "o1",
                        "refund_order",
                        json!({"order_no": "A1004", "user_id": "2"}),
                    )]),
                )
                .push("order_agent", Decision::answer("A1004 已提交退款"))
                .push("manager_agent", Decision::answer("A1004 已提交退款"))
                .push("gateway_agent", Decision::answer("已为您提交 A1004 的退款申请")),
        );
        let coordinator = assemble_coordinator(
            &cfg,
            Arc::new(MemoryCheckpointStore::default()),
            decider.clone(),
            None,
        )
        .unwrap();
        let answer = coordinator.post_turn("1", &Identity::new("1"), "帮我取消 A1004").await.unwrap();
        assert_eq!(answer, "已为您提交 A1004 的退款申请");

        // 模型伪造的 user_id 被网关覆盖：A1004 属于用户 1，退款成功
        let order_requests: Vec<_> = decider
            .recorded()
            .into_iter()
            .filter(|r| r.node == "order_agent")
            .collect();
        let tool_result = &order_requests[1].messages[2];
        assert!(tool_result.content.contains("退款中"));
    }
}
