//! 订单工具：get_order / check_cancelable / refund_order
//!
//! 共享一份内存订单簿；所有操作按网关注入的 user_id 做归属校验，refund_order 是唯一的写操作。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::tools::{Tool, ToolError};

/// 单个订单
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_no: String,
    pub user_id: String,
    pub status: String,
    pub items: String,
    pub amount: f64,
    pub logistics: String,
    pub cancelable: bool,
}

impl Order {
    fn describe(&self) -> String {
        let logistics = if self.logistics.is_empty() {
            "暂无物流更新"
        } else {
            &self.logistics
        };
        format!(
            "订单号：{}\n用户ID：{}\n订单状态：{}\n商品信息：{}\n支付金额：{} 元\n物流信息：{}\n可取消：{}",
            self.order_no,
            self.user_id,
            self.status,
            self.items,
            self.amount,
            logistics,
            if self.cancelable { "是" } else { "否" }
        )
    }
}

/// 订单簿（多个工具共享）
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    orders: Arc<RwLock<HashMap<String, Order>>>,
}

impl OrderBook {
    pub fn new(orders: impl IntoIterator<Item = Order>) -> Self {
        let map = orders.into_iter().map(|o| (o.order_no.clone(), o)).collect();
        Self {
            orders: Arc::new(RwLock::new(map)),
        }
    }

    /// 演示数据
    pub fn sample() -> Self {
        let row = |no: &str, user: &str, status: &str, items: &str, amount: f64, logistics: &str, cancelable: bool| Order {
            order_no: no.into(),
            user_id: user.into(),
            status: status.into(),
            items: items.into(),
            amount,
            logistics: logistics.into(),
            cancelable,
        };
        Self::new([
            row("A1001", "1", "待发货", "路由器 x1; 网线 x2", 328.0, "仓库已出库，等待揽收", true),
            row("A1002", "1", "配送中", "键盘 x1; 鼠标 x1", 278.0, "已到达上海转运中心，派送中", true),
            row("A1003", "2", "已签收", "显示器 x1", 1088.0, "已签收：收件人 张三", false),
            row("A1004", "1", "待支付", "夏科有线键鼠套装 x1", 50.0, "", true),
            row("A1005", "2", "待发货", "无线耳机 x2", 598.0, "订单已确认，等待发货", true),
            row("A1006", "3", "配送中", "移动硬盘 x1; U盘 x1", 458.0, "已发货，运输中", true),
        ])
    }

    pub async fn get(&self, order_no: &str) -> Option<Order> {
        self.orders.read().await.get(order_no).cloned()
    }

    /// 读取订单并校验归属
    async fn owned(&self, order_no: &str, user_id: &str) -> Result<Order, String> {
        match self.get(order_no).await {
            None => Err(format!("未找到订单号 {order_no} 的记录，请确认后再试。")),
            Some(o) if o.user_id != user_id => {
                Err(format!("订单 {order_no} 不属于当前用户，无权限操作。"))
            }
            Some(o) => Ok(o),
        }
    }

    /// 申请退款：仅在可取消时更新状态，并设为不可再取消
    async fn refund(&self, order_no: &str, user_id: &str) -> Result<String, String> {
        let mut orders = self.orders.write().await;
        let order = match orders.get_mut(order_no) {
            None => return Err(format!("未找到订单号 {order_no} 的记录，请确认后再试。")),
            Some(o) if o.user_id != user_id => {
                return Err(format!("订单 {order_no} 不属于当前用户，无权限操作。"))
            }
            Some(o) => o,
        };
        if !order.cancelable {
            return Ok(format!(
                "订单 {} 当前状态：{}，不可取消/退款。",
                order.order_no, order.status
            ));
        }
        let logistics = match order.status.as_str() {
            "待发货" | "待支付" => "订单已申请退款，商品未发出",
            "配送中" => "订单已申请退款，正在拦截配送",
            "已签收" => "订单已申请退款，等待退货处理",
            _ => "订单已申请退款，处理中",
        };
        order.status = "退款中".into();
        order.logistics = logistics.into();
        order.cancelable = false;
        Ok(format!(
            "订单 {} 已提交取消/退款申请，状态更新为：退款中。物流信息：{}。",
            order.order_no, logistics
        ))
    }
}

fn order_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "order_no": {"type": "string", "description": "订单号，如 A1001"},
            "user_id": {"type": "string", "description": "用户ID，用于权限校验"}
        },
        "required": ["order_no", "user_id"]
    })
}

fn order_args(args: &Value) -> Result<(&str, &str), ToolError> {
    let order_no = args
        .get("order_no")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::Permanent("missing order_no".into()))?;
    let user_id = args
        .get("user_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::Permanent("missing user_id".into()))?;
    Ok((order_no.trim(), user_id))
}

/// get_order：订单详情
pub struct GetOrderTool {
    book: OrderBook,
}

impl GetOrderTool {
    pub fn new(book: OrderBook) -> Self {
        Self { book }
    }
}

#[async_trait]
impl Tool for GetOrderTool {
    fn name(&self) -> &str {
        "get_order"
    }

    fn description(&self) -> &str {
        "获取指定订单号的订单详情"
    }

    fn parameters_schema(&self) -> Value {
        order_schema()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let (order_no, user_id) = order_args(&args)?;
        Ok(match self.book.owned(order_no, user_id).await {
            Ok(order) => order.describe(),
            Err(msg) => msg,
        })
    }
}

/// check_cancelable：是否可取消
pub struct CheckCancelableTool {
    book: OrderBook,
}

impl CheckCancelableTool {
    pub fn new(book: OrderBook) -> Self {
        Self { book }
    }
}

#[async_trait]
impl Tool for CheckCancelableTool {
    fn name(&self) -> &str {
        "check_cancelable"
    }

    fn description(&self) -> &str {
        "检查订单是否可以取消"
    }

    fn parameters_schema(&self) -> Value {
        order_schema()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let (order_no, user_id) = order_args(&args)?;
        Ok(match self.book.owned(order_no, user_id).await {
            Ok(o) if o.cancelable => format!("订单 {} 当前状态：{}，允许取消。", o.order_no, o.status),
            Ok(o) => format!("订单 {} 当前状态：{}，不可取消。", o.order_no, o.status),
            Err(msg) => msg,
        })
    }
}

/// refund_order：提交取消/退款
pub struct RefundOrderTool {
    book: OrderBook,
}

impl RefundOrderTool {
    pub fn new(book: OrderBook) -> Self {
        Self { book }
    }
}

#[async_trait]
impl Tool for RefundOrderTool {
    fn name(&self) -> &str {
        "refund_order"
    }

    fn description(&self) -> &str {
        "提交取消/退款操作：若允许取消则更新状态为退款中"
    }

    fn parameters_schema(&self) -> Value {
        order_schema()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let (order_no, user_id) = order_args(&args)?;
        Ok(match self.book.refund(order_no, user_id).await {
            Ok(msg) | Err(msg) => msg,
        })
    }
}
