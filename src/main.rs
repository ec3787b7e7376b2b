//! Concierge 命令行对话
//!
//! 从标准输入逐行读取用户消息，经会话协调器处理后打印回复。
//! 用户 ID 取第一个命令行参数，其次环境变量 CONCIERGE_USER，默认 "1"。

use anyhow::Context;
use concierge::{agent::create_coordinator, config::load_config, observability, Identity};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let coordinator = create_coordinator(&cfg)
        .await
        .context("Failed to create coordinator")?;

    let user_id = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONCIERGE_USER").ok())
        .unwrap_or_else(|| "1".to_string());
    let identity = Identity::new(user_id.clone());

    for message in coordinator
        .initialize_session(&user_id)
        .await
        .context("Failed to initialize session")?
        .iter()
        .filter(|m| m.is_user_visible())
    {
        println!("[{:?}] {}", message.role, message.content);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" || text == "/exit" {
            break;
        }
        match coordinator.post_turn(&user_id, &identity, text).await {
            Ok(answer) => println!("{}", answer),
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    Ok(())
}
