//! 售后政策查询：get_policy（关键词匹配的小型政策表）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolError};

const POLICIES: &[(&str, &[&str], &str)] = &[
    (
        "退货政策",
        &["退货", "七天", "7天", "无理由"],
        "自签收之日起 7 天内支持无理由退货，商品需保持完好、配件齐全；定制类商品除外。",
    ),
    (
        "退款时效",
        &["退款", "到账", "多久"],
        "退款审核通过后 1-3 个工作日原路退回，信用卡可能需要 7 个工作日。",
    ),
    (
        "取消订单",
        &["取消", "撤销"],
        "待支付、待发货、配送中的订单可申请取消；已签收订单请走退货流程。",
    ),
    (
        "配送说明",
        &["配送", "物流", "发货", "快递"],
        "现货商品 48 小时内发货，默认快递配送，偏远地区可能延迟 1-2 天。",
    ),
    (
        "保修政策",
        &["保修", "维修", "质量"],
        "电子类商品享受 1 年质保，质保期内非人为损坏免费维修或更换。",
    ),
];

/// get_policy
#[derive(Debug, Default)]
pub struct GetPolicyTool;

impl GetPolicyTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for GetPolicyTool {
    fn name(&self) -> &str {
        "get_policy"
    }

    fn description(&self) -> &str {
        "查询售后政策（退货、退款、取消、配送、保修等）"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": {"type": "string", "description": "用户关于售后政策的问题"},
                "user_id": {"type": "string", "description": "用户ID"}
            },
            "required": ["question", "user_id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let question = args
            .get("question")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if question.trim().is_empty() {
            return Err(ToolError::Permanent("missing question".into()));
        }
        let hits: Vec<String> = POLICIES
            .iter()
            .filter(|(_, keywords, _)| keywords.iter().any(|k| question.contains(k)))
            .map(|(title, _, text)| format!("【{title}】{text}"))
            .collect();
        if hits.is_empty() {
            Ok("未检索到相关政策，请转人工客服咨询。".to_string())
        } else {
            Ok(hits.join("\n"))
        }
    }
}
