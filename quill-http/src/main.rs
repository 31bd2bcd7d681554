use std::net::SocketAddr;
use std::sync::Arc;

use quill_audit::{GenerationLogger, InMemoryGenerationLog, JsonlGenerationLog};
use quill_core::{Components, GenerationPipeline, QuillConfig};
use quill_infer::{EchoModelClient, ModelPool};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = QuillConfig::from_env()?;

    // An empty QUILL_AUDIT_FILE keeps the log in memory.
    let audit: Arc<dyn GenerationLogger> = match std::env::var("QUILL_AUDIT_FILE") {
        Ok(path) if path.is_empty() => Arc::new(InMemoryGenerationLog::new()),
        Ok(path) => Arc::new(JsonlGenerationLog::open(path)?),
        Err(_) => Arc::new(JsonlGenerationLog::open("./generation.jsonl")?),
    };

    let small_id = std::env::var("QUILL_SMALL_MODEL").unwrap_or_else(|_| "echo-small".into());
    let big_id = std::env::var("QUILL_BIG_MODEL").unwrap_or_else(|_| "echo-big".into());
    let models = ModelPool {
        small: Arc::new(EchoModelClient::new(small_id)),
        big: Arc::new(EchoModelClient::new(big_id)),
    };

    let components = Components::in_memory(&cfg, models, audit)?;
    let pipeline = Arc::new(GenerationPipeline::new(cfg, components));

    let report = pipeline.schema_report()?;
    if report.upgrade_required {
        tracing::warn!(
            current = report.current_version,
            required = report.required_version,
            "storage schema is behind; gated features stay off until upgraded"
        );
    }

    let app = quill_http::app(pipeline);

    let addr: SocketAddr = std::env::var("QUILL_HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:7000".into())
        .parse()?;
    tracing::info!(%addr, "quill HTTP server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
