//! 轮次状态：AwaitingDecision -> (ToolRequested -> ToolResolved)* -> Final

use std::fmt;

use serde::Serialize;

/// 单个节点 turn loop 所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// 等待决策单元返回
    AwaitingDecision,
    /// 已追加携带 ToolCall 的 assistant 消息，正在解析调用
    ToolRequested,
    /// 每个调用都已追加 tool_result
    ToolResolved,
    /// 已追加最终 assistant 消息
    Final,
}

impl TurnPhase {
    /// 状态机允许的转移
    pub fn can_advance_to(self, next: TurnPhase) -> bool {
        use TurnPhase::*;
        matches!(
            (self, next),
            (AwaitingDecision, ToolRequested)
                | (AwaitingDecision, Final)
                | (ToolRequested, ToolResolved)
                | (ToolResolved, AwaitingDecision)
        )
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnPhase::AwaitingDecision => "awaiting_decision",
            TurnPhase::ToolRequested => "tool_requested",
            TurnPhase::ToolResolved => "tool_resolved",
            TurnPhase::Final => "final",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(TurnPhase::AwaitingDecision.can_advance_to(TurnPhase::Final));
        assert!(TurnPhase::ToolResolved.can_advance_to(TurnPhase::AwaitingDecision));
        assert!(!TurnPhase::ToolRequested.can_advance_to(TurnPhase::Final));
        assert!(!TurnPhase::Final.can_advance_to(TurnPhase::AwaitingDecision));
        assert_eq!(TurnPhase::ToolRequested.to_string(), "tool_requested");
    }
}
