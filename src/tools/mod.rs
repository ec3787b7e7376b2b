//! 工具层：Tool trait 与注册表、能力 schema、身份注入网关，以及订单 / 商品 / 政策演示工具

pub mod catalog;
pub mod gateway;
pub mod orders;
pub mod policy;
pub mod registry;
pub mod schema;

pub use catalog::{Catalog, Product, ProductBasicInfoTool, ProductFilter, ProductInfoTool, SearchProductsTool};
pub use gateway::ToolGateway;
pub use orders::{CheckCancelableTool, GetOrderTool, Order, OrderBook, RefundOrderTool};
pub use policy::GetPolicyTool;
pub use registry::{Tool, ToolError, ToolRegistry};
pub use schema::{delegate_schema, delegation_input, strip_parameter, CapabilitySchema, DelegateArgs};

/// 演示工具集：订单三件套共享同一订单簿，商品三件套共享同一商品库
pub fn demo_registry(book: OrderBook) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(GetOrderTool::new(book.clone()));
    registry.register(CheckCancelableTool::new(book.clone()));
    registry.register(RefundOrderTool::new(book));
    let catalog = Catalog::sample();
    registry.register(SearchProductsTool::new(catalog.clone()));
    registry.register(ProductInfoTool::new(catalog.clone()));
    registry.register(ProductBasicInfoTool::new(catalog));
    registry.register(GetPolicyTool::new());
    registry
}
