use crate::adapters::{ensure_not_denied, get_f64, get_i64};
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
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Statements the MySQL adapter refuses to forward.
const DENIED_STATEMENTS: &[&str] = &["DROP", "TRUNCATE", "SHUTDOWN", "GRANT", "REVOKE"];

/// A replica is considered healthy up to this many seconds behind.
const MAX_HEALTHY_LAG_SECONDS: i64 = 60;

/// Wire-level access used by the adapter. Deployments provide an
/// implementation over their MySQL client of choice; tests inject fakes.
#[async_trait::async_trait]
pub trait MysqlSource: Send + Sync {
    /// `SHOW GLOBAL STATUS` as a name/value map.
    async fn global_status(&self, ctx: &CallContext)
        -> Result<HashMap<String, String>, PluginError>;

    /// `SHOW GLOBAL VARIABLES` as a name/value map.
    async fn global_variables(
        &self,
        ctx: &CallContext,
    ) -> Result<HashMap<String, String>, PluginError>;

    /// `SHOW SLAVE STATUS`. `None` when the instance is not a replica.
    async fn slave_status(
        &self,
        ctx: &CallContext,
    ) -> Result<Option<HashMap<String, String>>, PluginError>;

    /// `SHOW PROCESSLIST`.
    async fn processlist(&self, ctx: &CallContext) -> Result<Vec<ConnectionInfo>, PluginError>;

    /// Recent slow-query-log entries.
    async fn slow_queries(&self, ctx: &CallContext) -> Result<Vec<SlowLogEntry>, PluginError>;

    async fn ping(&self, ctx: &CallContext) -> Result<(), PluginError>;

    async fn run_statement(
        &self,
        ctx: &CallContext,
        command: &Command,
    ) -> Result<serde_json::Value, PluginError>;
}

/// Derive the metric set from GLOBAL STATUS + GLOBAL VARIABLES.
///
/// Invariants: `qps` is present only when `Uptime > 0`;
/// `connection_usage` only when `max_connections > 0`.
fn derive_metrics(
    status: &HashMap<String, String>,
    variables: &HashMap<String, String>,
) -> MetricsSnapshot {
    let mut builder = MetricsSnapshot::builder();

    for counter in [
        "Queries",
        "Uptime",
        "Threads_connected",
        "Threads_running",
        "Slow_queries",
        "Aborted_connects",
        "Innodb_buffer_pool_reads",
        "Innodb_buffer_pool_read_requests",
        "Innodb_row_lock_waits",
        "Created_tmp_disk_tables",
        "Bytes_received",
        "Bytes_sent",
    ] {
        if let Some(v) = get_i64(status, counter) {
            builder.push(MetricValue::new(counter.to_ascii_lowercase(), v));
        }
    }

    if let Some(max_conn) = get_i64(variables, "max_connections") {
        builder.push(MetricValue::new("max_connections", max_conn));
    }

    let queries = get_f64(status, "Queries");
    let uptime = get_f64(status, "Uptime");
    if let (Some(queries), Some(uptime)) = (queries, uptime) {
        if uptime > 0.0 {
            builder.push(MetricValue::new("qps", queries / uptime).with_unit("1/s"));
        }
    }

    let connected = get_f64(status, "Threads_connected");
    let max_conn = get_f64(variables, "max_connections");
    if let (Some(connected), Some(max_conn)) = (connected, max_conn) {
        if max_conn > 0.0 {
            builder.push(
                MetricValue::new("connection_usage", connected / max_conn).with_unit("ratio"),
            );
        }
    }

    // Buffer pool hit rate from InnoDB read counters.
    let pool_reads = get_f64(status, "Innodb_buffer_pool_reads");
    let pool_requests = get_f64(status, "Innodb_buffer_pool_read_requests");
    if let (Some(reads), Some(requests)) = (pool_reads, pool_requests) {
        if requests > 0.0 {
            builder.push(
                MetricValue::new("buffer_pool_hit_rate", 1.0 - reads / requests).with_unit("ratio"),
            );
        }
    }

    builder.build()
}

/// Replication health per `SHOW SLAVE STATUS`: healthy iff both threads
/// run and the replica is at most [`MAX_HEALTHY_LAG_SECONDS`] behind.
/// No row means the instance is not a replica, which is healthy.
fn derive_replication(slave_status: Option<&HashMap<String, String>>) -> ReplicationStatus {
    let Some(row) = slave_status else {
        return ReplicationStatus {
            role: "master".to_string(),
            healthy: true,
            io_running: None,
            sql_running: None,
            lag_seconds: None,
            connected_replicas: 0,
            detail: "Not a slave".to_string(),
        };
    };

    let io_running = row
        .get("Slave_IO_Running")
        .map(|v| v.eq_ignore_ascii_case("yes"));
    let sql_running = row
        .get("Slave_SQL_Running")
        .map(|v| v.eq_ignore_ascii_case("yes"));
    let lag_seconds = get_i64(row, "Seconds_Behind_Master");

    let healthy = io_running == Some(true)
        && sql_running == Some(true)
        && lag_seconds.is_some_and(|lag| lag <= MAX_HEALTHY_LAG_SECONDS);

    let detail = if healthy {
        format!(
            "replica {} seconds behind master",
            lag_seconds.unwrap_or_default()
        )
    } else {
        format!(
            "IO={} SQL={} lag={:?}",
            row.get("Slave_IO_Running").cloned().unwrap_or_default(),
            row.get("Slave_SQL_Running").cloned().unwrap_or_default(),
            lag_seconds
        )
    };

    ReplicationStatus {
        role: "slave".to_string(),
        healthy,
        io_running,
        sql_running,
        lag_seconds,
        connected_replicas: 0,
        detail,
    }
}

pub struct MysqlPlugin {
    source: RwLock<Option<Arc<dyn MysqlSource>>>,
}

impl MysqlPlugin {
    pub fn new() -> Self {
        Self {
            source: RwLock::new(None),
        }
    }

    pub fn with_source(source: Arc<dyn MysqlSource>) -> Self {
        Self {
            source: RwLock::new(Some(source)),
        }
    }

    /// Swap in a wire source after construction.
    pub async fn attach_source(&self, source: Arc<dyn MysqlSource>) {
        *self.source.write().await = Some(source);
    }

    async fn source(&self) -> Result<Arc<dyn MysqlSource>, PluginError> {
        self.source
            .read()
            .await
            .clone()
            .ok_or(PluginError::NotConnected)
    }
}

impl Default for MysqlPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MiddlewarePlugin for MysqlPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: "mysql-adapter".to_string(),
            name: "MySQL Diagnostics".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            plugin_type: PluginType::Middleware,
            middleware_type: MiddlewareType::MySql,
            supported_versions: vec!["5.7".into(), "8.0".into(), "8.4".into()],
            capabilities: ["metrics", "slowlog", "replication", "processlist", "commands"]
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
        // The MySQL wire client is a deployment concern; a source must be
        // injected via `with_source` or `attach_source`. Connect verifies
        // the injected source is reachable.
        match self.source.read().await.clone() {
            Some(source) => source.ping(ctx).await,
            None => Err(PluginError::ConnectFailed {
                message: "mysql adapter requires an injected MysqlSource".to_string(),
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
        let status = source.global_status(ctx).await?;
        let variables = source.global_variables(ctx).await?;
        Ok(derive_metrics(&status, &variables))
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
                name: "SHOW STATUS".into(),
                description: "Server status counters".into(),
                risk: 1,
            },
            CommandSpec {
                name: "SHOW VARIABLES".into(),
                description: "Server configuration".into(),
                risk: 1,
            },
            CommandSpec {
                name: "SHOW PROCESSLIST".into(),
                description: "Active connections".into(),
                risk: 1,
            },
            CommandSpec {
                name: "EXPLAIN".into(),
                description: "Query plan inspection".into(),
                risk: 2,
            },
            CommandSpec {
                name: "ANALYZE TABLE".into(),
                description: "Refresh table statistics".into(),
                risk: 3,
            },
            CommandSpec {
                name: "KILL".into(),
                description: "Terminate a connection".into(),
                risk: 4,
            },
        ]
    }

    async fn get_diagnostic_data(&self, ctx: &CallContext) -> Result<DiagnosticData, PluginError> {
        let source = self.source().await?;
        let status = source.global_status(ctx).await?;
        let variables = source.global_variables(ctx).await?;
        let metrics = derive_metrics(&status, &variables);
        let replication = derive_replication(source.slave_status(ctx).await?.as_ref());

        let connections = source.processlist(ctx).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "mysql processlist failed; continuing without it");
            Vec::new()
        });
        let slow_logs = source.slow_queries(ctx).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "mysql slow query fetch failed; continuing without it");
            Vec::new()
        });

        let mut data = DiagnosticData::new(metrics);
        data.config = variables
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        data.slow_logs = slow_logs;
        data.connections = connections;
        data.replication = Some(replication);
        if let Some(version) = status.get("version").or_else(|| status.get("Version")) {
            data.extra
                .insert("server_version".to_string(), serde_json::json!(version));
        }
        Ok(data)
    }

    // Connection saturation is covered by the configurable threshold
    // analyzer rather than a fixed rule.
    fn builtin_rules(&self) -> Vec<DiagnosisRule> {
        vec![
            DiagnosisRule {
                id: "mysql-slow-queries".into(),
                name: "Slow Queries Detected".into(),
                severity: Severity::Warning,
                condition: "len(slowlogs) > 0".into(),
                message: "Slow query log contains recent entries".into(),
                suggestion: "Inspect the slow query log and add missing indexes".into(),
                tags: vec!["performance".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "mysql-replication-broken".into(),
                name: "Replication Unhealthy".into(),
                severity: Severity::Critical,
                condition: "replication.role == \"slave\" && !replication.healthy".into(),
                message: "Replication is unhealthy: {{replication.detail}}".into(),
                suggestion: "Check replica IO/SQL threads and network to the master".into(),
                tags: vec!["replication".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "mysql-buffer-pool-cold".into(),
                name: "Buffer Pool Hit Rate Low".into(),
                severity: Severity::Warning,
                condition: "metrics.buffer_pool_hit_rate < 0.95 && metrics.innodb_buffer_pool_read_requests > 10000"
                    .into(),
                message: "InnoDB buffer pool hit rate is {{metrics.buffer_pool_hit_rate}}".into(),
                suggestion: "Grow innodb_buffer_pool_size to keep the working set in memory".into(),
                tags: vec!["memory".into()],
                enabled: true,
            },
        ]
    }
}

/// Registry factory for [`MysqlPlugin`].
pub struct MysqlPluginFactory;

impl PluginFactory for MysqlPluginFactory {
    fn middleware_type(&self) -> MiddlewareType {
        MiddlewareType::MySql
    }

    fn create(&self, _config: &PluginConfig) -> Result<Arc<dyn MiddlewarePlugin>, PluginError> {
        Ok(Arc::new(MysqlPlugin::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn qps_requires_positive_uptime() {
        let status = map(&[("Queries", "1000"), ("Uptime", "100")]);
        let metrics = derive_metrics(&status, &HashMap::new());
        assert!((metrics.value("qps").unwrap() - 10.0).abs() < 1e-9);

        let fresh = map(&[("Queries", "1000"), ("Uptime", "0")]);
        assert!(derive_metrics(&fresh, &HashMap::new()).get("qps").is_none());
    }

    #[test]
    fn connection_usage_requires_positive_max() {
        let status = map(&[("Threads_connected", "95")]);
        let vars = map(&[("max_connections", "100")]);
        let metrics = derive_metrics(&status, &vars);
        assert!((metrics.value("connection_usage").unwrap() - 0.95).abs() < 1e-9);

        let no_max = map(&[("max_connections", "0")]);
        assert!(derive_metrics(&status, &no_max)
            .get("connection_usage")
            .is_none());
    }

    #[test]
    fn missing_slave_status_means_not_a_slave_and_healthy() {
        let repl = derive_replication(None);
        assert!(repl.healthy);
        assert_eq!(repl.detail, "Not a slave");
        assert_eq!(repl.role, "master");
    }

    #[test]
    fn replication_healthy_requires_both_threads_and_low_lag() {
        let healthy = map(&[
            ("Slave_IO_Running", "Yes"),
            ("Slave_SQL_Running", "Yes"),
            ("Seconds_Behind_Master", "5"),
        ]);
        assert!(derive_replication(Some(&healthy)).healthy);

        let lagging = map(&[
            ("Slave_IO_Running", "Yes"),
            ("Slave_SQL_Running", "Yes"),
            ("Seconds_Behind_Master", "61"),
        ]);
        assert!(!derive_replication(Some(&lagging)).healthy);

        let io_stopped = map(&[
            ("Slave_IO_Running", "No"),
            ("Slave_SQL_Running", "Yes"),
            ("Seconds_Behind_Master", "0"),
        ]);
        assert!(!derive_replication(Some(&io_stopped)).healthy);
    }

    #[test]
    fn lag_of_exactly_sixty_seconds_is_healthy() {
        let boundary = map(&[
            ("Slave_IO_Running", "Yes"),
            ("Slave_SQL_Running", "Yes"),
            ("Seconds_Behind_Master", "60"),
        ]);
        assert!(derive_replication(Some(&boundary)).healthy);
    }

    #[tokio::test]
    async fn destructive_statements_are_denied() {
        let plugin = MysqlPlugin::new();
        for stmt in ["DROP TABLE users", "TRUNCATE logs", "shutdown"] {
            let res = plugin
                .execute(&CallContext::background(), Command::new(stmt))
                .await;
            assert!(matches!(res, Err(PluginError::NotAllowed { .. })), "{stmt}");
        }
    }

    #[test]
    fn buffer_pool_hit_rate() {
        let status = map(&[
            ("Innodb_buffer_pool_reads", "50"),
            ("Innodb_buffer_pool_read_requests", "1000"),
        ]);
        let metrics = derive_metrics(&status, &HashMap::new());
        assert!((metrics.value("buffer_pool_hit_rate").unwrap() - 0.95).abs() < 1e-9);
    }
}
