//! 投递 worker 入口
//!
//! 从 Redis Streams 消费投递请求，分发到提供商适配器执行发送。
//! 启动前置条件（数据库、队列、消费组）任一不满足即退出，
//! 运行期通过 Ctrl+C / SIGTERM 优雅关闭。

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_shared::config::AppConfig;
use courier_shared::crypto::FieldEncryptor;
use courier_shared::database::Database;
use courier_shared::queue::{DeliveryQueue, StreamQueue};
use courier_shared::retry::DispatchRetryPolicy;

use delivery_worker::consumer::DeliveryConsumer;
use delivery_worker::processor::MessageProcessor;
use delivery_worker::providers::{ProviderRegistry, SesAdapter, SnsAdapter};
use delivery_worker::store::PgMessageStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("delivery-worker").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    init_tracing(&config);

    info!(environment = %config.environment, "Starting delivery-worker...");

    // 凭证加密器：无密钥时降级为明文直通，仅允许非生产环境
    let encryptor = match &config.encryption.key_hex {
        Some(key_hex) => FieldEncryptor::from_hex(key_hex).context("加密密钥加载失败")?,
        None if config.is_production() => {
            anyhow::bail!("生产环境必须配置 encryption.key_hex")
        }
        None => {
            warn!("未配置加密密钥，凭证按明文处理（仅限开发环境）");
            FieldEncryptor::passthrough()
        }
    };

    // 启动前置条件：数据库与队列必须就绪，失败直接退出
    let db = Database::connect(&config.database)
        .await
        .context("数据库连接失败")?;
    db.health_check().await.context("数据库健康检查失败")?;
    info!("Database connected");

    let queue = StreamQueue::new(&config.queue).context("队列客户端创建失败")?;
    queue.health_check().await.context("队列健康检查失败")?;
    queue.ensure_group().await.context("消费组创建失败")?;
    info!("Queue ready");

    let policy = DispatchRetryPolicy {
        max_attempts: config.worker.max_retry_attempts,
        base_delay: config.worker.base_retry_delay(),
    };

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(SesAdapter::new(encryptor.clone(), policy.clone())));
    registry.register(Arc::new(SnsAdapter::new(encryptor, policy)));

    let queue: Arc<dyn DeliveryQueue> = Arc::new(queue);
    let store = Arc::new(PgMessageStore::new(db.clone()));
    let processor = Arc::new(MessageProcessor::new(
        store,
        queue.clone(),
        Arc::new(registry),
    ));
    let consumer = DeliveryConsumer::new(queue, processor, &config.worker);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    consumer.run(shutdown_rx).await;

    db.close().await;
    info!("Service shutdown complete");
    Ok(())
}

/// 初始化日志
///
/// RUST_LOG 优先，其次取配置的 log_level；格式由 log_format 决定。
fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    if config.observability.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
