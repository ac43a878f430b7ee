//! # Stackdoctor CLI
//!
//! ```bash
//! # Diagnose a middleware instance
//! stackdoctor diagnose redis --query "why is memory growing" --output json
//!
//! # Install a plugin config into the managed plugin directory
//! stackdoctor install-plugin cache-main ./configs/cache-main.toml
//!
//! # Remove a managed plugin
//! stackdoctor uninstall-plugin cache-main
//! ```
//!
//! Exit codes: 0 success, 1 diagnosis failed, 2 plugin install/uninstall
//! failed, 3 invalid arguments.

use clap::{Parser, Subcommand, ValueEnum};
use stackdoctor_engine::ai::{AiAnalyzerBuilder, FewShotManager};
use stackdoctor_engine::analyzers::{AnomalyAnalyzer, ThresholdAnalyzer, TrendAnalyzer};
use stackdoctor_engine::config::EngineConfig;
use stackdoctor_engine::engine::{DiagnosisEngine, DiagnosisEngineBuilder};
use stackdoctor_engine::history::InMemoryHistoryStore;
use stackdoctor_engine::lifecycle::LifecycleManager;
use stackdoctor_engine::rag::{
    InMemoryKeywordStore, InMemoryVectorStore, RetrieverBuilder, ThresholdReranker,
};
use stackdoctor_engine::registry::PluginRegistry;
use stackdoctor_engine::watcher::load_plugin_file;
use stackdoctor_sdk::adapters::{
    ElasticsearchPluginFactory, KafkaPluginFactory, MysqlPluginFactory, PostgresPluginFactory,
    RedisPluginFactory,
};
use stackdoctor_sdk::llm::{HttpLlmAdapter, HttpLlmConfig};
use stackdoctor_sdk::models::{DiagnoseOptions, DiagnosisRequest, DiagnosisResult};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const EXIT_DIAGNOSIS_FAILED: u8 = 1;
const EXIT_PLUGIN_FAILED: u8 = 2;
const EXIT_INVALID_ARGS: u8 = 3;

#[derive(Parser)]
#[command(name = "stackdoctor", version, about = "AI-assisted middleware diagnosis")]
struct Cli {
    /// Path to the manager configuration file.
    #[arg(short, long, default_value = "stackdoctor.toml")]
    config: String,

    /// Log filter, e.g. `info` or `stackdoctor_engine=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Diagnose a middleware instance.
    Diagnose {
        /// Middleware type: redis, mysql, kafka, elasticsearch, postgresql.
        middleware: String,
        /// Instance name from the plugin configuration.
        #[arg(long)]
        instance: Option<String>,
        /// Deployment environment label.
        #[arg(long)]
        environment: Option<String>,
        /// Free-form question forwarded to the AI analyzer.
        #[arg(long)]
        query: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
        output: OutputFormat,
    },
    /// Install a plugin config file into the managed plugin directory.
    InstallPlugin { name: String, source: String },
    /// Remove a managed plugin config.
    UninstallPlugin { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version are not argument errors.
            if err.use_stderr() {
                eprintln!("{err}");
                return ExitCode::from(EXIT_INVALID_ARGS);
            }
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.clone())
        .init();

    let config = if Path::new(&cli.config).exists() {
        match EngineConfig::load(&cli.config) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("invalid configuration {}: {err}", cli.config);
                return ExitCode::from(EXIT_INVALID_ARGS);
            }
        }
    } else {
        EngineConfig::default()
    };

    match cli.command {
        Command::Diagnose {
            middleware,
            instance,
            environment,
            query,
            output,
        } => run_diagnose(config, middleware, instance, environment, query, output).await,
        Command::InstallPlugin { name, source } => install_plugin(&config, &name, &source),
        Command::UninstallPlugin { name } => uninstall_plugin(&config, &name),
    }
}

async fn run_diagnose(
    config: EngineConfig,
    middleware: String,
    instance: Option<String>,
    environment: Option<String>,
    query: Option<String>,
    output: OutputFormat,
) -> ExitCode {
    let registry = Arc::new(PluginRegistry::new());
    for result in [
        registry.register_factory(Arc::new(RedisPluginFactory)),
        registry.register_factory(Arc::new(MysqlPluginFactory)),
        registry.register_factory(Arc::new(KafkaPluginFactory)),
        registry.register_factory(Arc::new(ElasticsearchPluginFactory)),
        registry.register_factory(Arc::new(PostgresPluginFactory)),
    ] {
        if let Err(err) = result {
            eprintln!("factory registration failed: {err}");
            return ExitCode::from(EXIT_DIAGNOSIS_FAILED);
        }
    }

    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&registry),
        config.manager.health_check.clone(),
    ));

    // Bring up every enabled plugin matching the requested middleware.
    let wanted: Vec<_> = config
        .plugins
        .iter()
        .filter(|entry| entry.enabled && entry.middleware_type.as_str() == middleware)
        .collect();
    if wanted.is_empty() {
        eprintln!("no enabled plugin configured for middleware type {middleware}");
        return ExitCode::from(EXIT_DIAGNOSIS_FAILED);
    }
    for entry in &wanted {
        let plugin_config = entry.to_plugin_config();
        let ctx = stackdoctor_sdk::context::CallContext::with_timeout(Duration::from_secs(30));
        if let Err(err) = registry
            .create_plugin(&ctx, &entry.name, plugin_config)
            .await
        {
            eprintln!("plugin {} failed to connect: {err}", entry.name);
            return ExitCode::from(EXIT_DIAGNOSIS_FAILED);
        }
        if let Err(err) = lifecycle.start(&entry.name).await {
            eprintln!("plugin {} failed to start: {err}", entry.name);
            return ExitCode::from(EXIT_DIAGNOSIS_FAILED);
        }
    }

    let engine = match build_engine(&config, Arc::clone(&registry)) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("engine setup failed: {err}");
            return ExitCode::from(EXIT_DIAGNOSIS_FAILED);
        }
    };

    let request = DiagnosisRequest {
        middleware_type: middleware,
        instance: instance.unwrap_or_else(|| wanted[0].name.clone()),
        options: DiagnoseOptions {
            ai: config.ai.enabled,
            query,
            timeout: None,
            environment,
        },
    };

    let outcome = engine.diagnose(request).await;
    lifecycle.stop_all().await;

    match outcome {
        Ok(result) => {
            print_result(&result, output);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("diagnosis failed: {err}");
            ExitCode::from(EXIT_DIAGNOSIS_FAILED)
        }
    }
}

fn build_engine(
    config: &EngineConfig,
    registry: Arc<PluginRegistry>,
) -> Result<DiagnosisEngine, stackdoctor_engine::DiagnosisError> {
    let metrics_history = Arc::new(InMemoryHistoryStore::default());

    let mut builder = DiagnosisEngineBuilder::new(registry)
        .with_metrics_history(Arc::clone(&metrics_history) as _)
        .with_history_capacity(config.manager.history_size)
        .with_resilience(config.resilience.clone())
        .with_sandbox(stackdoctor_sdk::Sandbox::new(config.sandbox.clone())?)
        .with_analyzer(Arc::new(ThresholdAnalyzer::new(config.thresholds.clone())))
        .with_analyzer(Arc::new(AnomalyAnalyzer::new(
            Arc::clone(&metrics_history) as _
        )));
    if !config.trends.is_empty() {
        builder = builder.with_analyzer(Arc::new(TrendAnalyzer::new(
            Arc::clone(&metrics_history) as _,
            config.trends.clone(),
        )));
    }

    for path in &config.rules.paths {
        let rules = stackdoctor_engine::rules::load_rule_file(Path::new(path))?;
        builder = builder.with_rules(rules);
    }

    if config.ai.enabled {
        let llm = Arc::new(HttpLlmAdapter::new(HttpLlmConfig {
            base_url: config.ai.base_url.clone(),
            api_key: config.ai.api_key.clone(),
            model: config.ai.model.clone(),
            embedding_model: "text-embedding-3-small".to_string(),
            timeout: Duration::from_secs(60),
        })?);

        let retriever = Arc::new(
            RetrieverBuilder::new(Arc::new(InMemoryVectorStore::new()))
                .with_keyword(Arc::new(InMemoryKeywordStore::new()))
                .with_reranker(Arc::new(ThresholdReranker::new(config.rag.rerank_min_score)))
                .with_config(config.rag.clone())
                .build(),
        );

        let analyzer = AiAnalyzerBuilder::new(llm, retriever)
            .with_config(config.ai.clone())
            .with_fewshot(Arc::new(FewShotManager::new(None)))
            .build();
        builder = builder.with_ai(Arc::new(analyzer));
    }

    Ok(builder.build())
}

fn print_result(result: &DiagnosisResult, output: OutputFormat) {
    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(result) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("failed to serialize result: {err}"),
        },
        OutputFormat::Human => {
            println!(
                "Diagnosis of {} ({}) — {:?}",
                result.instance_id, result.middleware_type, result.status
            );
            println!("Health score: {}/100", result.health_score);
            println!("{}", result.summary);
            for issue in &result.issues {
                println!();
                println!("[{}] {}", issue.severity, issue.name);
                if !issue.description.is_empty() {
                    println!("  {}", issue.description);
                }
                if !issue.suggestion.is_empty() {
                    println!("  suggestion: {}", issue.suggestion);
                }
            }
        }
    }
}

fn plugin_dir(config: &EngineConfig) -> PathBuf {
    config
        .manager
        .config_watch_dir
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("plugins.d"))
}

fn install_plugin(config: &EngineConfig, name: &str, source: &str) -> ExitCode {
    let entry = match load_plugin_file(Path::new(source)) {
        Ok(entry) => entry,
        Err(err) => {
            eprintln!("plugin config {source} is invalid: {err}");
            return ExitCode::from(EXIT_PLUGIN_FAILED);
        }
    };
    if entry.name != name {
        eprintln!(
            "plugin name mismatch: config declares {} but {name} was requested",
            entry.name
        );
        return ExitCode::from(EXIT_PLUGIN_FAILED);
    }

    let dir = plugin_dir(config);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        eprintln!("cannot create plugin directory {}: {err}", dir.display());
        return ExitCode::from(EXIT_PLUGIN_FAILED);
    }
    let target = dir.join(format!("{name}.toml"));
    match std::fs::copy(source, &target) {
        Ok(_) => {
            println!("installed plugin {name} at {}", target.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("install failed: {err}");
            ExitCode::from(EXIT_PLUGIN_FAILED)
        }
    }
}

fn uninstall_plugin(config: &EngineConfig, name: &str) -> ExitCode {
    let target = plugin_dir(config).join(format!("{name}.toml"));
    if !target.exists() {
        eprintln!("no installed plugin named {name}");
        return ExitCode::from(EXIT_PLUGIN_FAILED);
    }
    match std::fs::remove_file(&target) {
        Ok(()) => {
            println!("uninstalled plugin {name}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("uninstall failed: {err}");
            ExitCode::from(EXIT_PLUGIN_FAILED)
        }
    }
}
