use std::collections::BTreeMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use quill_audit::{verify_log, GenerationLogger, JsonlGenerationLog, LogFilter};
use quill_core::{Components, GenerationPipeline, QuillConfig};
use quill_infer::{EchoModelClient, ModelPool};
use quill_types::{GenerationParams, GenerationRequest, ModelPreference, RequestContext};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quill")]
struct Cli {
    /// YAML config; falls back to QUILL_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run requests through the pipeline with local echo models.
    Demo {
        #[arg(long, default_value = "Write the opening scene at the harbour.")]
        prompt: String,
        #[arg(long, default_value = "demo-project")]
        project: String,
        #[arg(long, default_value = "scene-draft")]
        template: String,
        /// Submit the same request this many times to exercise the cache.
        #[arg(long, default_value_t = 2)]
        repeat: usize,
        #[arg(long)]
        prefer_big: bool,
        /// Feature overrides applied before the run, e.g. --enable enhanced-cache.
        #[arg(long)]
        enable: Vec<String>,
        #[arg(long)]
        disable: Vec<String>,
        #[arg(long, env = "QUILL_AUDIT_FILE", default_value = "./generation.jsonl")]
        audit: String,
    },
    Logs {
        #[command(subcommand)]
        action: LogCommand,
        #[arg(long, env = "QUILL_AUDIT_FILE", default_value = "./generation.jsonl")]
        path: String,
    },
    /// Resolved feature flags for the configured store.
    Features {
        #[arg(long)]
        enable: Vec<String>,
        #[arg(long)]
        disable: Vec<String>,
        #[arg(long)]
        stable: bool,
        #[arg(long)]
        rollback: bool,
    },
    Schema {
        #[command(subcommand)]
        action: SchemaCommand,
    },
}

#[derive(Subcommand)]
enum LogCommand {
    Tail {
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
    Verify,
    Query {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        min_quality: Option<f64>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Costs {
        #[arg(long)]
        project: String,
    },
}

#[derive(Subcommand)]
enum SchemaCommand {
    Report,
}

fn load_config(path: Option<&str>) -> anyhow::Result<QuillConfig> {
    match path {
        Some(p) => QuillConfig::from_path(p),
        None => QuillConfig::from_env(),
    }
}

fn pipeline(cfg: QuillConfig, audit: Arc<dyn GenerationLogger>) -> anyhow::Result<GenerationPipeline> {
    let models = ModelPool {
        small: Arc::new(EchoModelClient::new("echo-small")),
        big: Arc::new(EchoModelClient::new("echo-big")),
    };
    let components = Components::in_memory(&cfg, models, audit)?;
    Ok(GenerationPipeline::new(cfg, components))
}

fn apply_overrides(p: &GenerationPipeline, enable: &[String], disable: &[String]) -> anyhow::Result<()> {
    for name in enable {
        p.set_feature_override(name, true)?;
        tracing::info!(flag = %name, "override: enabled");
    }
    for name in disable {
        p.set_feature_override(name, false)?;
        tracing::info!(flag = %name, "override: disabled");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Demo {
            prompt,
            project,
            template,
            repeat,
            prefer_big,
            enable,
            disable,
            audit,
        } => {
            let log = Arc::new(JsonlGenerationLog::open(&audit)?);
            tracing::info!(%audit, repeat, "running demo pipeline");
            let p = pipeline(cfg, log)?;
            apply_overrides(&p, &enable, &disable)?;

            let req = GenerationRequest {
                template_id: template,
                template_version: 1,
                rendered_prompt: prompt,
                variables: BTreeMap::new(),
                model_class: "prose".into(),
                params: GenerationParams::default(),
                context: RequestContext {
                    project_id: project,
                    ..Default::default()
                },
                hints: prefer_big.then_some(ModelPreference::PreferBig),
                required_entities: Vec::new(),
            };
            for _ in 0..repeat.max(1) {
                match p.submit(req.clone()).await {
                    Ok(out) => println!("{}", serde_json::to_string_pretty(&out)?),
                    Err(err) => tracing::error!(kind = %err.kind(), error = %err, "generation failed"),
                }
            }
        }
        Command::Logs { action, path } => match action {
            LogCommand::Tail { lines } => {
                let content = std::fs::read_to_string(&path)?;
                let all: Vec<&str> = content.lines().collect();
                let start = all.len().saturating_sub(lines);
                for line in &all[start..] {
                    println!("{line}");
                }
            }
            LogCommand::Verify => {
                let n = verify_log(&path)?;
                println!("generation log ok ({n} entries)");
            }
            LogCommand::Query {
                project,
                min_quality,
                offset,
                limit,
            } => {
                let p = pipeline(cfg, Arc::new(JsonlGenerationLog::open(&path)?))?;
                let page = p
                    .list_logs(&LogFilter {
                        project_id: project,
                        cache_tier: None,
                        min_quality,
                        offset,
                        limit,
                    })
                    .await?;
                println!("{}", serde_json::to_string_pretty(&page)?);
            }
            LogCommand::Costs { project } => {
                let p = pipeline(cfg, Arc::new(JsonlGenerationLog::open(&path)?))?;
                let summary = p.cost_summary(&project).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        },
        Command::Features {
            enable,
            disable,
            stable,
            rollback,
        } => {
            let p = pipeline(cfg, Arc::new(quill_audit::InMemoryGenerationLog::new()))?;
            if rollback {
                p.rollback_to_legacy()?;
            }
            if stable {
                p.enable_stable_features()?;
            }
            apply_overrides(&p, &enable, &disable)?;
            for state in p.feature_states() {
                println!(
                    "{:<20} {:<5} default={:<5} override={:<5} {}",
                    state.flag.name,
                    state.enabled,
                    state.flag.default_enabled,
                    state
                        .override_value
                        .map_or("-".to_string(), |v| v.to_string()),
                    serde_json::to_string(&state.resolution)?
                );
            }
        }
        Command::Schema { action } => match action {
            SchemaCommand::Report => {
                let p = pipeline(cfg, Arc::new(quill_audit::InMemoryGenerationLog::new()))?;
                let report = p.schema_report()?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        },
    }

    Ok(())
}
