//! 商品工具：search_products / get_product_info / get_product_basic_info，共享同一商品库

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolError};

/// 商品条目
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub category: String,
    pub brand: String,
    pub price: f64,
    pub stock: u32,
    pub summary: String,
    /// 下架商品不出现在检索结果中
    pub on_sale: bool,
}

impl Product {
    fn stock_status(&self) -> &'static str {
        match self.stock {
            0 => "缺货",
            1..=10 => "库存紧张",
            11..=50 => "库存正常",
            _ => "库存充足",
        }
    }

    fn status(&self) -> &'static str {
        if self.on_sale {
            "在售"
        } else {
            "已下架"
        }
    }
}

/// 检索条件；全部为空时列出所有在售商品
#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
    pub query: Option<String>,
    pub category: Option<String>,
    pub max_price: Option<f64>,
}

impl ProductFilter {
    fn from_args(args: &Value) -> Result<Self, ToolError> {
        let text = |key: &str| {
            args.get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        let max_price = match args.get("max_price") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_f64()
                    .filter(|p| *p >= 0.0)
                    .ok_or_else(|| ToolError::Permanent(format!("invalid max_price: {v}")))?,
            ),
        };
        Ok(Self {
            query: text("query"),
            category: text("category"),
            max_price,
        })
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(q) = &self.query {
            parts.push(format!("关键词「{q}」"));
        }
        if let Some(c) = &self.category {
            parts.push(format!("分类「{c}」"));
        }
        if let Some(p) = self.max_price {
            parts.push(format!("价格≤{p}元"));
        }
        if parts.is_empty() {
            "当前条件".to_string()
        } else {
            parts.join("、")
        }
    }
}

/// 商品库（克隆共享同一份数据）
#[derive(Debug, Clone)]
pub struct Catalog {
    products: Arc<Vec<Product>>,
}

impl Catalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            products: Arc::new(products),
        }
    }

    /// 演示商品库
    pub fn sample() -> Self {
        let p = |id: &str, name: &str, category: &str, brand: &str, price: f64, stock: u32, summary: &str| Product {
            id: id.into(),
            name: name.into(),
            category: category.into(),
            brand: brand.into(),
            price,
            stock,
            summary: summary.into(),
            on_sale: true,
        };
        let mut retired = p("P2001", "百兆路由器 N300", "网络", "夏科", 89.0, 0, "单频 300M");
        retired.on_sale = false;
        Self::new(vec![
            p("P1001", "夏科有线键鼠套装", "外设", "夏科", 50.0, 120, "USB 有线键盘鼠标套装，即插即用"),
            p("P1002", "夏科机械键盘 K87", "外设", "夏科", 299.0, 35, "87 键红轴，支持热插拔"),
            p("P1003", "千兆双频路由器 AX3000", "网络", "联拓", 259.0, 48, "Wi-Fi 6，四天线，适合 120 平米"),
            p("P1004", "超六类网线 3 米", "网络", "联拓", 19.9, 500, "千兆传输，纯铜线芯"),
            p("P1005", "27 寸 2K 显示器", "显示", "明视", 1088.0, 8, "IPS 面板，75Hz，低蓝光"),
            p("P1006", "降噪无线耳机 B2", "音频", "声湃", 299.0, 60, "主动降噪，续航 30 小时"),
            p("P1007", "1TB 移动硬盘", "存储", "存优", 379.0, 0, "USB 3.0，金属外壳"),
            retired,
        ])
    }

    /// 按关键词命中数排序，同分按价格升序；分类与价格为硬性过滤
    pub fn search(&self, filter: &ProductFilter, limit: usize) -> Vec<&Product> {
        let terms: Vec<String> = filter
            .query
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let mut scored: Vec<(usize, &Product)> = self
            .products
            .iter()
            .filter(|p| p.on_sale)
            .filter(|p| filter.category.as_deref().map_or(true, |c| p.category == c))
            .filter(|p| filter.max_price.map_or(true, |max| p.price <= max))
            .filter_map(|p| {
                if terms.is_empty() {
                    return Some((0, p));
                }
                let haystack = format!("{} {} {}", p.name, p.category, p.summary).to_lowercase();
                let score = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (score > 0).then_some((score, p))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.price.total_cmp(&b.1.price)));
        scored.into_iter().take(limit).map(|(_, p)| p).collect()
    }

    /// 按商品 ID 精确匹配，其次名称包含，最后退回关键词检索的首条
    pub fn lookup(&self, key: &str) -> Option<&Product> {
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        self.products
            .iter()
            .find(|p| p.id.eq_ignore_ascii_case(key))
            .or_else(|| self.products.iter().find(|p| p.name.contains(key)))
            .or_else(|| {
                let filter = ProductFilter {
                    query: Some(key.to_string()),
                    ..Default::default()
                };
                self.search(&filter, 1).into_iter().next()
            })
    }
}

fn required_text<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::Permanent(format!("missing {key}")))
}

/// search_products：关键词 / 分类 / 最高价组合检索
pub struct SearchProductsTool {
    catalog: Catalog,
    max_results: usize,
}

impl SearchProductsTool {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            max_results: 5,
        }
    }

    pub fn with_max_results(mut self, n: usize) -> Self {
        self.max_results = n.max(1);
        self
    }
}

#[async_trait]
impl Tool for SearchProductsTool {
    fn name(&self) -> &str {
        "search_products"
    }

    fn description(&self) -> &str {
        "检索商品，支持按关键词、分类、最高价格筛选"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "商品关键词，多个关键词用空格分隔"},
                "category": {"type": "string", "description": "商品分类，例如：外设、网络、显示、音频、存储"},
                "max_price": {"type": "number", "description": "最高价格（元）"},
                "user_id": {"type": "string", "description": "用户ID"}
            },
            "required": ["user_id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let filter = ProductFilter::from_args(&args)?;
        let hits = self.catalog.search(&filter, self.max_results);
        if hits.is_empty() {
            return Ok(format!("未找到符合{}的商品，请尝试调整搜索条件。", filter.describe()));
        }
        let lines: Vec<String> = hits
            .iter()
            .map(|p| {
                format!(
                    "- [{}] {}（{}）：{} 元，库存 {}，{}",
                    p.id, p.name, p.category, p.price, p.stock, p.summary
                )
            })
            .collect();
        Ok(format!("找到 {} 个符合条件的商品：\n{}", hits.len(), lines.join("\n")))
    }
}

/// get_product_info：商品详情
pub struct ProductInfoTool {
    catalog: Catalog,
}

impl ProductInfoTool {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Tool for ProductInfoTool {
    fn name(&self) -> &str {
        "get_product_info"
    }

    fn description(&self) -> &str {
        "根据商品ID、名称或描述获取商品详细信息"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "product": {"type": "string", "description": "商品ID、名称或描述，例如：P1001、夏科有线键鼠套装"},
                "user_id": {"type": "string", "description": "用户ID"}
            },
            "required": ["product", "user_id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let key = required_text(&args, "product")?;
        let Some(p) = self.catalog.lookup(key) else {
            return Ok(format!("未找到与「{key}」相关的商品，请检查商品名称或换个关键词。"));
        };
        Ok(format!(
            "商品ID：{}\n商品名称：{}\n分类：{}\n品牌：{}\n价格：{} 元\n库存：{} 件\n商品描述：{}\n状态：{}",
            p.id,
            p.name,
            p.category,
            p.brand,
            p.price,
            p.stock,
            p.summary,
            p.status()
        ))
    }
}

/// get_product_basic_info：价格与库存状态
pub struct ProductBasicInfoTool {
    catalog: Catalog,
}

impl ProductBasicInfoTool {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Tool for ProductBasicInfoTool {
    fn name(&self) -> &str {
        "get_product_basic_info"
    }

    fn description(&self) -> &str {
        "获取商品的价格与库存状态"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "product": {"type": "string", "description": "商品ID或名称"},
                "user_id": {"type": "string", "description": "用户ID"}
            },
            "required": ["product", "user_id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let key = required_text(&args, "product")?;
        let Some(p) = self.catalog.lookup(key) else {
            return Ok(format!("未找到商品「{key}」，请检查商品名称是否正确。"));
        };
        if !p.on_sale {
            return Ok(format!("商品「{}」当前状态：{}，暂不可购买。", p.name, p.status()));
        }
        let mut out = format!(
            "商品：{}\n价格：{} 元\n当前库存：{} 件\n库存状态：{}",
            p.name,
            p.price,
            p.stock,
            p.stock_status()
        );
        if p.stock == 0 {
            out.push_str("\n提示：该商品目前缺货，建议选择其他商品或稍后再试。");
        }
        Ok(out)
    }
}
