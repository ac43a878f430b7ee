//! # Diagnosis Engine
//!
//! Orchestrates one diagnosis request end to end:
//!
//! 1. Resolve a running plugin instance for the requested middleware.
//! 2. Collect the immutable [`DiagnosticData`] snapshot (a failure here
//!    aborts the request with `DiagnosisFailed`).
//! 3. Evaluate rules sequentially and run every analyzer on its own
//!    task; per-rule and per-analyzer failures are logged and recovered.
//! 4. Optionally run the RAG-augmented AI analyzer; an LLM failure
//!    aborts only the AI phase — rule-based findings are still returned.
//! 5. Merge all issues, stable-sort by severity descending, compute the
//!    health score and status, and record the result into the bounded
//!    history.
//!
//! A single engine instance is thread-safe and serves many concurrent
//! requests.

use crate::ai::AiAnalyzer;
use crate::analyzers::Analyzer;
use crate::config::ResilienceConfig;
use crate::error::DiagnosisError;
use crate::history::{DiagnosisHistory, InMemoryHistoryStore, MetricsHistoryStore};
use crate::registry::{PluginInstance, PluginRegistry};
use crate::rules::RuleEngine;
use chrono::Utc;
use dashmap::DashMap;
use stackdoctor_sdk::context::CallContext;
use stackdoctor_sdk::guard::GuardedPlugin;
use stackdoctor_sdk::middleware::{
    CircuitBreakerMiddleware, MiddlewareChain, RateLimiterMiddleware, RetryMiddleware,
    TimeoutMiddleware,
};
use stackdoctor_sdk::models::{
    health_score, Command, CommandResult, DiagnosisRequest, DiagnosisResult, DiagnosisRule,
    DiagnosisStatus, DiagnosticData, Issue, Severity,
};
use stackdoctor_sdk::sandbox::Sandbox;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_AI_QUERY: &str = "Diagnose the current state of this instance";

pub struct DiagnosisEngine {
    registry: Arc<PluginRegistry>,
    rule_engine: RuleEngine,
    analyzers: Vec<Arc<dyn Analyzer>>,
    extra_rules: std::sync::RwLock<Vec<DiagnosisRule>>,
    ai: Option<Arc<AiAnalyzer>>,
    metrics_history: Arc<dyn MetricsHistoryStore>,
    history: DiagnosisHistory,
    default_timeout: Duration,
    resilience: ResilienceConfig,
    sandbox: Option<Arc<Sandbox>>,
    /// Per-instance guarded handles; breaker and limiter state live here.
    guards: DashMap<String, Arc<GuardedPlugin>>,
}

pub struct DiagnosisEngineBuilder {
    registry: Arc<PluginRegistry>,
    analyzers: Vec<Arc<dyn Analyzer>>,
    extra_rules: Vec<DiagnosisRule>,
    ai: Option<Arc<AiAnalyzer>>,
    metrics_history: Option<Arc<dyn MetricsHistoryStore>>,
    history_capacity: usize,
    default_timeout: Duration,
    resilience: ResilienceConfig,
    sandbox: Option<Arc<Sandbox>>,
}

impl DiagnosisEngineBuilder {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            analyzers: Vec::new(),
            extra_rules: Vec::new(),
            ai: None,
            metrics_history: None,
            history_capacity: 100,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            resilience: ResilienceConfig::default(),
            sandbox: None,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.push(analyzer);
        self
    }

    pub fn with_rules(mut self, rules: Vec<DiagnosisRule>) -> Self {
        self.extra_rules.extend(rules);
        self
    }

    pub fn with_ai(mut self, ai: Arc<AiAnalyzer>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_metrics_history(mut self, store: Arc<dyn MetricsHistoryStore>) -> Self {
        self.metrics_history = Some(store);
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = Some(Arc::new(sandbox));
        self
    }

    pub fn build(self) -> DiagnosisEngine {
        DiagnosisEngine {
            registry: self.registry,
            rule_engine: RuleEngine::new(),
            analyzers: self.analyzers,
            extra_rules: std::sync::RwLock::new(self.extra_rules),
            ai: self.ai,
            metrics_history: self
                .metrics_history
                .unwrap_or_else(|| Arc::new(InMemoryHistoryStore::default())),
            history: DiagnosisHistory::new(self.history_capacity),
            default_timeout: self.default_timeout,
            resilience: self.resilience,
            sandbox: self.sandbox,
            guards: DashMap::new(),
        }
    }
}

impl DiagnosisEngine {
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &DiagnosisHistory {
        &self.history
    }

    /// Add rules (e.g. from loaded rule files) on top of plugin builtins.
    pub fn add_rules(&self, rules: Vec<DiagnosisRule>) {
        self.extra_rules
            .write()
            .expect("rules lock poisoned")
            .extend(rules);
    }

    /// Run one diagnosis request.
    pub async fn diagnose(
        &self,
        request: DiagnosisRequest,
    ) -> Result<DiagnosisResult, DiagnosisError> {
        let request_id = Uuid::new_v4().to_string();
        let start_time = Utc::now();
        let started = std::time::Instant::now();
        let timeout = request.options.timeout.unwrap_or(self.default_timeout);
        let ctx = CallContext::with_timeout(timeout);

        // Resolve an available instance: by explicit name first, then by
        // middleware type.
        let instance = self
            .registry
            .get(&request.instance)
            .or_else(|_| self.registry.get_by_middleware(&request.middleware_type))?;

        tracing::info!(
            request = %request_id,
            middleware = %request.middleware_type,
            instance = %instance.name,
            "diagnosis started"
        );

        // Collect the snapshot through the guarded (resilience + sandbox)
        // path; this failure aborts the request.
        let data = self
            .guard_for(&instance)
            .get_diagnostic_data(&ctx)
            .await
            .map_err(|err| DiagnosisError::DiagnosisFailed {
                message: format!("diagnostic collection failed: {err}"),
            })?;
        self.metrics_history.record(&instance.name, &data.metrics);
        let data = Arc::new(data);

        // Rules: builtins plus loaded extras, evaluated sequentially.
        let mut rules = instance.plugin.builtin_rules();
        rules.extend(self.extra_rules.read().expect("rules lock poisoned").clone());
        let mut issues = self.rule_engine.evaluate(&rules, &data);

        // Analyzers run concurrently, each on its own task.
        issues.extend(self.run_analyzers(&instance.name, Arc::clone(&data)).await);

        // Optional AI phase; failures degrade, never abort.
        if request.options.ai {
            if let Some(ai) = &self.ai {
                let query = request
                    .options
                    .query
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AI_QUERY.to_string());
                match ai
                    .analyze(&ctx, &instance.name, &request.middleware_type, &query, &data)
                    .await
                {
                    Ok(outcome) => {
                        if outcome.needs_clarification {
                            tracing::info!(
                                request = %request_id,
                                "ai analysis needs clarification"
                            );
                        }
                        issues.push(outcome.to_issue());
                    }
                    Err(err) => {
                        tracing::warn!(
                            request = %request_id,
                            error = %err,
                            "ai phase failed; returning rule-based findings"
                        );
                    }
                }
            }
        }

        // Stable sort, severity descending.
        issues.sort_by_key(|issue| std::cmp::Reverse(issue.severity));

        let score = health_score(&issues);
        let status = DiagnosisStatus::from_issues(&issues);
        let summary = summarize(&issues);
        let end_time = Utc::now();

        let result = DiagnosisResult {
            request_id: request_id.clone(),
            middleware_type: request.middleware_type.clone(),
            instance_id: instance.name.clone(),
            start_time,
            end_time,
            duration_ms: started.elapsed().as_millis() as u64,
            issues,
            summary,
            health_score: score,
            status,
            diagnostic_data: Some(Arc::try_unwrap(data).unwrap_or_else(|arc| (*arc).clone())),
        };

        self.history.push(result.clone());
        tracing::info!(
            request = %request_id,
            issues = result.issues.len(),
            health_score = result.health_score,
            "diagnosis finished"
        );
        Ok(result)
    }

    /// Execute a plugin command through the guarded path: the resilience
    /// chain applies, the sandbox allow-list gates the operation, and the
    /// plugin's own deny list still has the final say.
    pub async fn execute_command(
        &self,
        middleware: &str,
        instance: Option<&str>,
        command: Command,
    ) -> Result<CommandResult, DiagnosisError> {
        let instance = match instance {
            Some(name) => self.registry.get(name)?,
            None => self.registry.get_by_middleware(middleware)?,
        };
        let ctx = CallContext::with_timeout(self.default_timeout);
        Ok(self.guard_for(&instance).execute(&ctx, command).await?)
    }

    /// Per-instance guard, created on first use so circuit-breaker and
    /// rate-limiter state persists across requests.
    fn guard_for(&self, instance: &PluginInstance) -> Arc<GuardedPlugin> {
        self.guards
            .entry(instance.name.clone())
            .or_insert_with(|| {
                let mut chain = MiddlewareChain::new()
                    .layer(Arc::new(TimeoutMiddleware::new(self.resilience.call_timeout)))
                    .layer(Arc::new(RetryMiddleware::new(self.resilience.retry.clone())))
                    .layer(Arc::new(CircuitBreakerMiddleware::new(
                        instance.name.clone(),
                        self.resilience.circuit_breaker.clone(),
                    )));
                if let Some(limiter) = &self.resilience.rate_limiter {
                    chain = chain.layer(Arc::new(RateLimiterMiddleware::new(limiter.clone())));
                }
                Arc::new(GuardedPlugin::new(
                    Arc::clone(&instance.plugin),
                    &chain,
                    self.sandbox.clone(),
                ))
            })
            .clone()
    }

    async fn run_analyzers(&self, instance: &str, data: Arc<DiagnosticData>) -> Vec<Issue> {
        let mut tasks = Vec::new();
        for analyzer in &self.analyzers {
            let analyzer = Arc::clone(analyzer);
            let data = Arc::clone(&data);
            let instance = instance.to_string();
            tasks.push(tokio::spawn(async move {
                let name = analyzer.name();
                (name, analyzer.analyze(&instance, &data).await)
            }));
        }

        let mut issues = Vec::new();
        for task in tasks {
            match task.await {
                Ok((_, Ok(mut found))) => issues.append(&mut found),
                Ok((name, Err(err))) => {
                    tracing::warn!(analyzer = name, error = %err, "analyzer failed; recovered");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "analyzer task join failed; recovered");
                }
            }
        }
        issues
    }
}

fn summarize(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return "No issues detected".to_string();
    }
    let count = |severity: Severity| issues.iter().filter(|i| i.severity == severity).count();
    format!(
        "{} issue(s): {} critical, {} error, {} warning, {} info",
        issues.len(),
        count(Severity::Critical),
        count(Severity::Error),
        count(Severity::Warning),
        count(Severity::Info)
    )
}
