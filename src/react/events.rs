//! 轮次过程事件：用于流式展示决策、工具调用、结果与最终回复

use serde::Serialize;

use crate::core::TurnPhase;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 节点进入新阶段
    Phase { node: String, phase: TurnPhase },
    /// 调用工具或子智能体
    ToolCall {
        node: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    ToolResult {
        node: String,
        tool: String,
        preview: String,
    },
    /// 节点给出最终回答
    Final { node: String, text: String },
    /// 整轮失败
    Failure { text: String },
}
