//! Turn loop 主循环
//!
//! AwaitingDecision -> 决策 -> 若有 ToolCall：追加 assistant(calls)，逐个解析（网关叶子工具或子节点），
//! 按发出顺序追加 tool_result，回到 AwaitingDecision；若只有文本：追加最终 assistant 并结束。
//! 子节点在只含委派参数的独立子日志上递归执行同一个循环，因此层级中每一层都复用这里的实现。
//! 决策次数上限对整个外部请求共享；超出时返回 DecisionLoopExceeded，这是唯一终止整轮的错误。

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{DispatchError, Identity, TurnPhase};
use crate::dispatch::{AgentNode, Capability, DispatchHierarchy};
use crate::llm::DecisionRequest;
use crate::memory::{fresh_call_id, Message, ToolCall};
use crate::react::TurnEvent;
use crate::tools::delegation_input;

/// 工具结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 一次外部请求内共享的决策计数
#[derive(Debug)]
pub struct DecisionBudget {
    used: AtomicUsize,
    max: usize,
}

impl DecisionBudget {
    pub fn new(max: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            max,
        }
    }

    /// 占用一次决策；超出上限返回 DecisionLoopExceeded
    pub fn take(&self) -> Result<usize, DispatchError> {
        let n = self.used.fetch_add(1, Ordering::SeqCst) + 1;
        if n > self.max {
            return Err(DispatchError::DecisionLoopExceeded(self.max));
        }
        Ok(n)
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst).min(self.max)
    }
}

/// 单次外部请求的上下文：调用方身份、决策预算、可选事件通道
#[derive(Clone)]
pub struct TurnContext {
    pub identity: Identity,
    pub budget: Arc<DecisionBudget>,
    pub events: Option<UnboundedSender<TurnEvent>>,
}

impl TurnContext {
    pub fn new(identity: Identity, max_decision_cycles: usize) -> Self {
        Self {
            identity,
            budget: Arc::new(DecisionBudget::new(max_decision_cycles)),
            events: None,
        }
    }

    pub fn with_events(mut self, tx: UnboundedSender<TurnEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, ev: TurnEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(ev);
        }
    }

    /// 推进状态机；非法转移只在 debug 构建中断言
    fn advance(&self, node: &AgentNode, current: &mut Option<TurnPhase>, next: TurnPhase) {
        debug_assert!(
            current.map_or(next == TurnPhase::AwaitingDecision, |p| p.can_advance_to(next)),
            "illegal turn phase transition {:?} -> {}",
            current,
            next
        );
        *current = Some(next);
        self.phase(node, next);
    }

    fn phase(&self, node: &AgentNode, phase: TurnPhase) {
        tracing::debug!(node = node.name(), %phase, "turn phase");
        self.emit(TurnEvent::Phase {
            node: node.name().to_string(),
            phase,
        });
    }
}

/// 每次日志追加后的持久化钩子（仅根节点使用）
#[async_trait]
pub trait StepCheckpoint: Send {
    async fn checkpoint(&mut self, messages: &mut Vec<Message>) -> Result<(), DispatchError>;
}

/// 在 messages 上运行 node 的 turn loop，返回最终回答文本
pub fn run_turn<'a>(
    hierarchy: &'a DispatchHierarchy,
    node: &'a AgentNode,
    messages: &'a mut Vec<Message>,
    ctx: &'a TurnContext,
    mut checkpoint: Option<&'a mut dyn StepCheckpoint>,
) -> BoxFuture<'a, Result<String, DispatchError>> {
    Box::pin(async move {
        let mut phase = None;
        loop {
            ctx.advance(node, &mut phase, TurnPhase::AwaitingDecision);
            let cycle = ctx.budget.take()?;
            let decision = node
                .decider()
                .decide(DecisionRequest {
                    node: node.name(),
                    directive: node.directive(),
                    messages,
                    capabilities: node.schemas(),
                })
                .await?;

            if decision.is_final() {
                messages.push(Message::assistant(decision.text.clone()));
                if let Some(cp) = checkpoint.as_deref_mut() {
                    cp.checkpoint(messages).await?;
                }
                ctx.advance(node, &mut phase, TurnPhase::Final);
                ctx.emit(TurnEvent::Final {
                    node: node.name().to_string(),
                    text: decision.text.clone(),
                });
                tracing::info!(node = node.name(), cycle, "final answer");
                return Ok(decision.text);
            }

            let mut calls = decision.tool_calls;
            let renamed = assign_unique_ids(&mut calls, messages);
            if renamed > 0 {
                tracing::warn!(node = node.name(), renamed, "reassigned empty or duplicate tool call ids");
            }
            messages.push(Message::assistant_with_calls(decision.text, calls.clone()));
            if let Some(cp) = checkpoint.as_deref_mut() {
                cp.checkpoint(messages).await?;
            }
            ctx.advance(node, &mut phase, TurnPhase::ToolRequested);

            // 并发解析，结果按发出顺序收集
            let parallel = hierarchy.settings().max_parallel_tools;
            let pending: Vec<_> = calls
                .iter()
                .map(|call| resolve_call(hierarchy, node, call, ctx))
                .collect();
            let results: Vec<Result<String, DispatchError>> =
                stream::iter(pending).buffered(parallel).collect().await;

            for (call, result) in calls.iter().zip(results) {
                let content = result?;
                ctx.emit(TurnEvent::ToolResult {
                    node: node.name().to_string(),
                    tool: call.name.clone(),
                    preview: preview(&content),
                });
                messages.push(Message::tool_result(call.id.clone(), content));
            }
            if let Some(cp) = checkpoint.as_deref_mut() {
                cp.checkpoint(messages).await?;
            }
            ctx.advance(node, &mut phase, TurnPhase::ToolResolved);
        }
    })
}

/// 调用 id 在日志内必须唯一：空 id、同一决策内重复、或与已有消息冲突的调用换成新 id。
/// 返回被替换的个数。
fn assign_unique_ids(calls: &mut [ToolCall], messages: &[Message]) -> usize {
    let mut seen: HashSet<String> = messages
        .iter()
        .flat_map(|m| {
            m.tool_calls
                .iter()
                .map(|c| c.id.clone())
                .chain(m.tool_call_id.clone())
        })
        .collect();
    let mut renamed = 0;
    for call in calls.iter_mut() {
        if call.id.trim().is_empty() || seen.contains(&call.id) {
            call.id = fresh_call_id();
            renamed += 1;
        }
        seen.insert(call.id.clone());
    }
    renamed
}

/// 解析单个 ToolCall，返回 tool_result 内容。
/// 工具失败、身份缺失、未知能力、子节点的普通失败都转为内容；只有 DecisionLoopExceeded 向上传播。
async fn resolve_call(
    hierarchy: &DispatchHierarchy,
    node: &AgentNode,
    call: &ToolCall,
    ctx: &TurnContext,
) -> Result<String, DispatchError> {
    ctx.emit(TurnEvent::ToolCall {
        node: node.name().to_string(),
        tool: call.name.clone(),
        args: serde_json::Value::Object(call.args.clone()),
    });
    match node.capability(&call.name) {
        None => {
            tracing::warn!(node = node.name(), capability = %call.name, "unknown capability requested");
            Ok(DispatchError::UnknownCapability(call.name.clone()).as_tool_result())
        }
        Some(Capability::Leaf(tool)) => {
            match hierarchy
                .gateway()
                .invoke(tool, &call.args, &ctx.identity)
                .await
            {
                Ok(content) => Ok(content),
                Err(e) => {
                    tracing::warn!(node = node.name(), tool = %tool, error = %e, "tool failed");
                    Ok(e.as_tool_result())
                }
            }
        }
        Some(Capability::Child(child)) => {
            let mut sub_log = vec![Message::user(delegation_input(&call.args))];
            tracing::info!(parent = node.name(), child = child.name(), "delegating");
            match run_turn(hierarchy, child, &mut sub_log, ctx, None).await {
                Ok(answer) => Ok(answer),
                Err(e) if e.is_turn_fatal() => Err(e),
                Err(e) => {
                    tracing::warn!(child = child.name(), error = %e, "child agent failed");
                    Ok(e.as_tool_result())
                }
            }
        }
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", content.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        content.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::AgentDescriptor;
    use crate::llm::{Decision, ScriptedDecider};
    use crate::memory::{check_pairing, Role};
    use crate::tools::{demo_registry, OrderBook, ToolGateway};
    use serde_json::json;

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::from_json(id, name, args)
    }

    fn hierarchy(decider: Arc<ScriptedDecider>, max_cycles: usize) -> DispatchHierarchy {
        let mut gw = ToolGateway::new(5);
        gw.register_all(&demo_registry(OrderBook::sample()), "user_id");
        DispatchHierarchy::builder(Arc::new(gw))
            .default_decider(decider)
            .entry("root")
            .agent(
                AgentDescriptor::new("root", "entry")
                    .with_tools(["get_order", "get_policy"])
                    .with_children(["order_agent"]),
            )
            .agent(AgentDescriptor::new("order_agent", "orders").with_tools(["get_order"]))
            .settings(crate::dispatch::DispatchSettings {
                max_decision_cycles: max_cycles,
                max_parallel_tools: 2,
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_tool_round_trip() {
        let decider = Arc::new(
            ScriptedDecider::new()
                .push("root", Decision::call(vec![call("c1", "get_order", json!({"order_no": "A1001"}))]))
                .push("root", Decision::answer("您的订单待发货")),
        );
        let h = hierarchy(Arc::clone(&decider), 8);
        let ctx = TurnContext::new(Identity::new("1"), 8);
        let mut log = vec![Message::user("query order A1001")];
        let answer = run_turn(&h, h.entry(), &mut log, &ctx, None).await.unwrap();

        assert_eq!(answer, "您的订单待发货");
        let roles: Vec<Role> = log.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]);
        assert!(log[2].content.contains("路由器"));
        assert_eq!(ctx.budget.used(), 2);
    }

    #[tokio::test]
    async fn test_results_follow_issue_order() {
        let decider = Arc::new(
            ScriptedDecider::new()
                .push(
                    "root",
                    Decision::call(vec![
                        call("c1", "get_policy", json!({"question": "退款多久到账"})),
                        call("c2", "get_order", json!({"order_no": "A1002"})),
                        call("c3", "get_order", json!({"order_no": "A1001"})),
                    ]),
                )
                .push("root", Decision::answer("ok")),
        );
        let h = hierarchy(decider, 8);
        let ctx = TurnContext::new(Identity::new("1"), 8);
        let mut log = vec![Message::user("q")];
        run_turn(&h, h.entry(), &mut log, &ctx, None).await.unwrap();
        let ids: Vec<&str> = log
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert!(check_pairing(&log).is_ok());
    }

    #[tokio::test]
    async fn test_child_sees_only_delegated_task() {
        let decider = Arc::new(
            ScriptedDecider::new()
                .push("root", Decision::call(vec![call("c1", "order_agent", json!({"task": "查询订单 A1001"}))]))
                .push("order_agent", Decision::call(vec![call("k1", "get_order", json!({"order_no": "A1001"}))]))
                .push("order_agent", Decision::answer("A1001 待发货"))
                .push("root", Decision::answer("您的订单 A1001 待发货")),
        );
        let h = hierarchy(Arc::clone(&decider), 8);
        let ctx = TurnContext::new(Identity::new("1"), 8);
        let mut log = vec![
            Message::user("earlier secret question"),
            Message::assistant("earlier answer"),
            Message::user("我的订单 A1001 到哪了"),
        ];
        run_turn(&h, h.entry(), &mut log, &ctx, None).await.unwrap();

        let child_requests: Vec<_> = decider
            .recorded()
            .into_iter()
            .filter(|r| r.node == "order_agent")
            .collect();
        assert_eq!(child_requests[0].messages, vec![Message::user("查询订单 A1001")]);
        for req in &child_requests {
            assert!(req.messages.iter().all(|m| !m.content.contains("secret")));
        }
        assert_eq!(child_requests[0].capabilities, vec!["get_order".to_string()]);
        // 父日志只记录子节点的最终回答
        assert_eq!(log[4].content, "A1001 待发货");
        assert_eq!(log.len(), 6);
    }

    #[tokio::test]
    async fn test_unknown_capability_answered_with_error() {
        let decider = Arc::new(
            ScriptedDecider::new()
                .push("root", Decision::call(vec![call("c1", "refund_order", json!({"order_no": "A1001"}))]))
                .push("root", Decision::answer("抱歉")),
        );
        let h = hierarchy(decider, 8);
        let ctx = TurnContext::new(Identity::new("1"), 8);
        let mut log = vec![Message::user("退款")];
        run_turn(&h, h.entry(), &mut log, &ctx, None).await.unwrap();
        assert!(log[2].content.contains("not an available tool"));
    }

    #[tokio::test]
    async fn test_budget_is_shared_with_children() {
        let decider = Arc::new(
            ScriptedDecider::new()
                .push("root", Decision::call(vec![call("c1", "order_agent", json!({"task": "loop"}))]))
                .with_fallback(Decision::call(vec![ToolCall::new("get_order", serde_json::Map::new())])),
        );
        let h = hierarchy(decider, 3);
        let ctx = TurnContext::new(Identity::new("1"), 3);
        let mut log = vec![Message::user("q")];
        let err = run_turn(&h, h.entry(), &mut log, &ctx, None).await.unwrap_err();
        assert_eq!(err, DispatchError::DecisionLoopExceeded(3));
        assert!(err.is_turn_fatal());
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let decider = Arc::new(
            ScriptedDecider::new()
                .push("root", Decision::call(vec![call("c1", "get_order", json!({"order_no": "A1001"}))]))
                .push("root", Decision::answer("done")),
        );
        let h = hierarchy(decider, 8);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = TurnContext::new(Identity::new("1"), 8).with_events(tx);
        let mut log = vec![Message::user("q")];
        run_turn(&h, h.entry(), &mut log, &ctx, None).await.unwrap();
        drop(ctx);
        let mut saw_tool_result = false;
        let mut last = None;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, TurnEvent::ToolResult { .. }) {
                saw_tool_result = true;
            }
            last = Some(ev);
        }
        assert!(saw_tool_result);
        assert!(matches!(last, Some(TurnEvent::Final { .. })));
    }

    #[tokio::test]
    async fn test_reused_and_empty_call_ids_are_replaced() {
        let decider = Arc::new(
            ScriptedDecider::new()
                .push("root", Decision::call(vec![call("call_0", "get_order", json!({"order_no": "A1001"}))]))
                .push("root", Decision::answer("first"))
                .push("root", Decision::call(vec![call("call_0", "get_order", json!({"order_no": "A1002"}))]))
                .push(
                    "root",
                    Decision::call(vec![
                        call("", "get_order", json!({"order_no": "A1001"})),
                        call("", "get_order", json!({"order_no": "A1002"})),
                    ]),
                )
                .push("root", Decision::answer("second")),
        );
        let h = hierarchy(decider, 8);
        let mut log = vec![Message::user("q1")];
        run_turn(&h, h.entry(), &mut log, &TurnContext::new(Identity::new("1"), 8), None)
            .await
            .unwrap();
        log.push(Message::user("q2"));
        run_turn(&h, h.entry(), &mut log, &TurnContext::new(Identity::new("1"), 8), None)
            .await
            .unwrap();

        assert!(check_pairing(&log).is_ok());
        // 第一次出现的 id 保留，之后的冲突被替换
        assert_eq!(log[1].tool_calls[0].id, "call_0");
        let reused = &log[5].tool_calls[0].id;
        assert_ne!(reused, "call_0");
        assert_eq!(log[6].tool_call_id.as_deref(), Some(reused.as_str()));
        let pair = &log[7].tool_calls;
        assert!(pair.iter().all(|c| !c.id.is_empty()));
        assert_ne!(pair[0].id, pair[1].id);
    }

    #[test]
    fn test_assign_unique_ids_keeps_distinct_ids() {
        let log = vec![Message::assistant_with_calls("", vec![call("a", "get_order", json!({}))])];
        let mut calls = vec![call("b", "get_order", json!({})), call("c", "get_order", json!({}))];
        assert_eq!(assign_unique_ids(&mut calls, &log), 0);
        assert_eq!(calls[0].id, "b");
        let mut calls = vec![call("a", "get_order", json!({}))];
        assert_eq!(assign_unique_ids(&mut calls, &log), 1);
        assert!(calls[0].id.starts_with("call_"));
    }

    #[tokio::test]
    async fn test_phase_events_follow_state_machine() {
        let decider = Arc::new(
            ScriptedDecider::new()
                .push("root", Decision::call(vec![call("c1", "order_agent", json!({"task": "A1001"}))]))
                .push("order_agent", Decision::answer("待发货"))
                .push("root", Decision::answer("done")),
        );
        let h = hierarchy(decider, 8);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = TurnContext::new(Identity::new("1"), 8).with_events(tx);
        let mut log = vec![Message::user("q")];
        run_turn(&h, h.entry(), &mut log, &ctx, None).await.unwrap();
        drop(ctx);

        let mut root_phases = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let TurnEvent::Phase { node, phase } = ev {
                if node == "root" {
                    root_phases.push(phase);
                }
            }
        }
        assert_eq!(root_phases.first(), Some(&TurnPhase::AwaitingDecision));
        assert_eq!(root_phases.last(), Some(&TurnPhase::Final));
        assert!(root_phases.windows(2).all(|w| w[0].can_advance_to(w[1])));
    }
}
