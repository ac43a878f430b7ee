use crate::adapters::{ensure_not_denied, get_f64};
use crate::context::CallContext;
use crate::error::PluginError;
use crate::models::{
    Command, CommandResult, CommandSpec, ConnectionInfo, DiagnosisRule, DiagnosticData,
    MetricValue, MetricsSnapshot, ReplicationStatus, Severity, SlowLogEntry,
};
use crate::plugin::{
    ConnectionConfig, MiddlewarePlugin, MiddlewareType, PluginConfig, PluginFactory, PluginInfo,
    PluginType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const DENIED_STATEMENTS: &[&str] = &["DROP", "TRUNCATE", "ALTER", "GRANT", "REVOKE"];

/// Aggregated `pg_stat_database` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub datname: String,
    pub numbackends: i64,
    pub xact_commit: i64,
    pub xact_rollback: i64,
    pub blks_read: i64,
    pub blks_hit: i64,
    pub tup_fetched: i64,
    pub tup_inserted: i64,
    pub tup_updated: i64,
    pub tup_deleted: i64,
    pub deadlocks: i64,
    #[serde(default)]
    pub temp_bytes: i64,
}

/// One `pg_stat_replication` row as seen from the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaStat {
    pub application_name: String,
    pub state: String,
    /// Replay lag in seconds, when reported.
    pub replay_lag_seconds: Option<i64>,
}

/// Wire-level access used by the adapter. Deployments provide an
/// implementation over their PostgreSQL client of choice; tests inject
/// fakes.
#[async_trait::async_trait]
pub trait PostgresSource: Send + Sync {
    async fn database_stats(&self, ctx: &CallContext) -> Result<Vec<DatabaseStats>, PluginError>;

    /// `SHOW ALL` / `pg_settings` as a name/value map.
    async fn settings(&self, ctx: &CallContext) -> Result<HashMap<String, String>, PluginError>;

    /// `pg_stat_activity`.
    async fn activity(&self, ctx: &CallContext) -> Result<Vec<ConnectionInfo>, PluginError>;

    /// `pg_stat_replication` rows; empty on standbys and standalone
    /// primaries.
    async fn replication(&self, ctx: &CallContext) -> Result<Vec<ReplicaStat>, PluginError>;

    /// Whether this instance is in recovery (a standby).
    async fn in_recovery(&self, ctx: &CallContext) -> Result<bool, PluginError>;

    /// Slow statements, e.g. from `pg_stat_statements`.
    async fn slow_statements(&self, ctx: &CallContext) -> Result<Vec<SlowLogEntry>, PluginError>;

    async fn ping(&self, ctx: &CallContext) -> Result<(), PluginError>;

    async fn run_statement(
        &self,
        ctx: &CallContext,
        command: &Command,
    ) -> Result<serde_json::Value, PluginError>;
}

/// Derive the metric set from pg_stat_database rows and settings.
///
/// `cache_hit_rate` is present only when `blks_hit + blks_read > 0`;
/// `connection_usage` only when `max_connections > 0`.
fn derive_metrics(stats: &[DatabaseStats], settings: &HashMap<String, String>) -> MetricsSnapshot {
    let mut builder = MetricsSnapshotAccumulator::default();
    for row in stats {
        builder.backends += row.numbackends;
        builder.commits += row.xact_commit;
        builder.rollbacks += row.xact_rollback;
        builder.blks_read += row.blks_read;
        builder.blks_hit += row.blks_hit;
        builder.deadlocks += row.deadlocks;
        builder.temp_bytes += row.temp_bytes;
    }

    let mut out = MetricsSnapshot::builder();
    out.push(MetricValue::new("numbackends", builder.backends));
    out.push(MetricValue::new("xact_commit", builder.commits));
    out.push(MetricValue::new("xact_rollback", builder.rollbacks));
    out.push(MetricValue::new("blks_read", builder.blks_read));
    out.push(MetricValue::new("blks_hit", builder.blks_hit));
    out.push(MetricValue::new("deadlocks", builder.deadlocks));
    out.push(MetricValue::new("temp_bytes", builder.temp_bytes).with_unit("bytes"));

    let total_blocks = (builder.blks_hit + builder.blks_read) as f64;
    if total_blocks > 0.0 {
        out.push(
            MetricValue::new("cache_hit_rate", builder.blks_hit as f64 / total_blocks)
                .with_unit("ratio"),
        );
    }

    if let Some(max_conn) = get_f64(settings, "max_connections") {
        out.push(MetricValue::new("max_connections", max_conn as i64));
        if max_conn > 0.0 {
            out.push(
                MetricValue::new("connection_usage", builder.backends as f64 / max_conn)
                    .with_unit("ratio"),
            );
        }
    }

    let total_xacts = (builder.commits + builder.rollbacks) as f64;
    if total_xacts > 0.0 {
        out.push(
            MetricValue::new("rollback_ratio", builder.rollbacks as f64 / total_xacts)
                .with_unit("ratio"),
        );
    }
    out.build()
}

#[derive(Default)]
struct MetricsSnapshotAccumulator {
    backends: i64,
    commits: i64,
    rollbacks: i64,
    blks_read: i64,
    blks_hit: i64,
    deadlocks: i64,
    temp_bytes: i64,
}

fn derive_replication(in_recovery: bool, replicas: &[ReplicaStat]) -> ReplicationStatus {
    if in_recovery {
        return ReplicationStatus {
            role: "standby".to_string(),
            healthy: true,
            io_running: None,
            sql_running: None,
            lag_seconds: None,
            connected_replicas: 0,
            detail: "standby in recovery".to_string(),
        };
    }
    let streaming = replicas.iter().filter(|r| r.state == "streaming").count() as u32;
    let worst_lag = replicas.iter().filter_map(|r| r.replay_lag_seconds).max();
    let healthy = replicas.is_empty() || streaming == replicas.len() as u32;
    ReplicationStatus {
        role: "primary".to_string(),
        healthy,
        io_running: None,
        sql_running: None,
        lag_seconds: worst_lag,
        connected_replicas: replicas.len() as u32,
        detail: format!("{streaming}/{} replicas streaming", replicas.len()),
    }
}

pub struct PostgresPlugin {
    source: RwLock<Option<Arc<dyn PostgresSource>>>,
}

impl PostgresPlugin {
    pub fn new() -> Self {
        Self {
            source: RwLock::new(None),
        }
    }

    pub fn with_source(source: Arc<dyn PostgresSource>) -> Self {
        Self {
            source: RwLock::new(Some(source)),
        }
    }

    pub async fn attach_source(&self, source: Arc<dyn PostgresSource>) {
        *self.source.write().await = Some(source);
    }

    async fn source(&self) -> Result<Arc<dyn PostgresSource>, PluginError> {
        self.source
            .read()
            .await
            .clone()
            .ok_or(PluginError::NotConnected)
    }
}

impl Default for PostgresPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MiddlewarePlugin for PostgresPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: "postgresql-adapter".to_string(),
            name: "PostgreSQL Diagnostics".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            plugin_type: PluginType::Middleware,
            middleware_type: MiddlewareType::Postgres,
            supported_versions: vec!["13".into(), "14".into(), "15".into(), "16".into()],
            capabilities: ["metrics", "replication", "activity", "commands"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            requires: Default::default(),
        }
    }

    async fn connect(
        &self,
        ctx: &CallContext,
        _config: &ConnectionConfig,
    ) -> Result<(), PluginError> {
        match self.source.read().await.clone() {
            Some(source) => source.ping(ctx).await,
            None => Err(PluginError::ConnectFailed {
                message: "postgresql adapter requires an injected PostgresSource".to_string(),
            }),
        }
    }

    async fn disconnect(&self, _ctx: &CallContext) -> Result<(), PluginError> {
        *self.source.write().await = None;
        Ok(())
    }

    async fn ping(&self, ctx: &CallContext) -> Result<(), PluginError> {
        self.source().await?.ping(ctx).await
    }

    fn is_connected(&self) -> bool {
        self.source.try_read().map(|s| s.is_some()).unwrap_or(false)
    }

    async fn collect_metrics(&self, ctx: &CallContext) -> Result<MetricsSnapshot, PluginError> {
        let source = self.source().await?;
        let stats = source.database_stats(ctx).await?;
        let settings = source.settings(ctx).await?;
        Ok(derive_metrics(&stats, &settings))
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        command: Command,
    ) -> Result<CommandResult, PluginError> {
        ensure_not_denied(DENIED_STATEMENTS, &command)?;
        if command.dry_run {
            return Ok(CommandResult {
                success: true,
                output: None,
                message: format!("dry run: would execute {}", command.name),
                dry_run: true,
            });
        }
        let ctx = match command.timeout {
            Some(timeout) => ctx.child_with_timeout(timeout),
            None => ctx.child(),
        };
        let output = self.source().await?.run_statement(&ctx, &command).await?;
        Ok(CommandResult {
            success: true,
            output: Some(output),
            message: String::new(),
            dry_run: false,
        })
    }

    fn supported_commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec {
                name: "SELECT".into(),
                description: "Read-only query".into(),
                risk: 1,
            },
            CommandSpec {
                name: "EXPLAIN".into(),
                description: "Query plan inspection".into(),
                risk: 1,
            },
            CommandSpec {
                name: "VACUUM".into(),
                description: "Reclaim dead tuples".into(),
                risk: 3,
            },
            CommandSpec {
                name: "REINDEX".into(),
                description: "Rebuild an index".into(),
                risk: 4,
            },
        ]
    }

    async fn get_diagnostic_data(&self, ctx: &CallContext) -> Result<DiagnosticData, PluginError> {
        let source = self.source().await?;
        let stats = source.database_stats(ctx).await?;
        let settings = source.settings(ctx).await?;
        let metrics = derive_metrics(&stats, &settings);

        let in_recovery = source.in_recovery(ctx).await.unwrap_or(false);
        let replicas = source.replication(ctx).await.unwrap_or_default();
        let replication = derive_replication(in_recovery, &replicas);

        let connections = source.activity(ctx).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "pg_stat_activity fetch failed; continuing without it");
            Vec::new()
        });
        let slow_logs = source.slow_statements(ctx).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "slow statement fetch failed; continuing without it");
            Vec::new()
        });

        let mut data = DiagnosticData::new(metrics);
        data.config = settings
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        data.connections = connections;
        data.slow_logs = slow_logs;
        data.replication = Some(replication);
        Ok(data)
    }

    fn builtin_rules(&self) -> Vec<DiagnosisRule> {
        vec![
            DiagnosisRule {
                id: "pg-connections-high".into(),
                name: "Connection Usage High".into(),
                severity: Severity::Error,
                condition: "metrics.connection_usage > 0.85".into(),
                message: "Connection usage is {{metrics.connection_usage}} of max_connections"
                    .into(),
                suggestion: "Introduce a pooler (pgbouncer) or raise max_connections".into(),
                tags: vec!["connections".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "pg-cache-hit-low".into(),
                name: "Cache Hit Rate Low".into(),
                severity: Severity::Warning,
                condition: "metrics.cache_hit_rate < 0.90 && metrics.blks_hit + metrics.blks_read > 10000"
                    .into(),
                message: "Buffer cache hit rate is {{metrics.cache_hit_rate}}".into(),
                suggestion: "Grow shared_buffers or investigate sequential scans".into(),
                tags: vec!["memory".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "pg-deadlocks".into(),
                name: "Deadlocks Observed".into(),
                severity: Severity::Warning,
                condition: "metrics.deadlocks > 0".into(),
                message: "{{metrics.deadlocks}} deadlocks recorded since stats reset".into(),
                suggestion: "Audit transaction ordering in the offending workloads".into(),
                tags: vec!["locks".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "pg-replication-broken".into(),
                name: "Replication Unhealthy".into(),
                severity: Severity::Critical,
                condition: "replication.role == \"primary\" && !replication.healthy".into(),
                message: "Replication is unhealthy: {{replication.detail}}".into(),
                suggestion: "Check replica connectivity and WAL sender state".into(),
                tags: vec!["replication".into()],
                enabled: true,
            },
        ]
    }
}

/// Registry factory for [`PostgresPlugin`].
pub struct PostgresPluginFactory;

impl PluginFactory for PostgresPluginFactory {
    fn middleware_type(&self) -> MiddlewareType {
        MiddlewareType::Postgres
    }

    fn create(&self, _config: &PluginConfig) -> Result<Arc<dyn MiddlewarePlugin>, PluginError> {
        Ok(Arc::new(PostgresPlugin::new()))
    }
}
