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
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Commands the Redis adapter refuses to forward.
const DENIED_COMMANDS: &[&str] = &["FLUSHALL", "FLUSHDB", "SHUTDOWN", "DEBUG", "CONFIG", "KEYS"];

const SLOWLOG_FETCH: i64 = 32;

/// Wire-level access used by the adapter. The production implementation
/// is [`RedisClientSource`]; tests inject fakes.
#[async_trait::async_trait]
pub trait RedisSource: Send + Sync {
    /// Flattened `INFO` key/value pairs across all sections.
    async fn info(&self, ctx: &CallContext) -> Result<HashMap<String, String>, PluginError>;

    /// `CONFIG GET *` as a key/value map.
    async fn config_entries(&self, ctx: &CallContext)
        -> Result<HashMap<String, String>, PluginError>;

    async fn slowlog(&self, ctx: &CallContext, limit: i64) -> Result<Vec<SlowLogEntry>, PluginError>;

    async fn client_list(&self, ctx: &CallContext) -> Result<Vec<ConnectionInfo>, PluginError>;

    async fn ping(&self, ctx: &CallContext) -> Result<(), PluginError>;

    async fn run_command(
        &self,
        ctx: &CallContext,
        command: &Command,
    ) -> Result<serde_json::Value, PluginError>;
}

/// `redis`-crate backed source over a multiplexed connection.
pub struct RedisClientSource {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisClientSource {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, PluginError> {
        let scheme = if config.tls { "rediss" } else { "redis" };
        let auth = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            _ => String::new(),
        };
        let db = config.database.as_deref().unwrap_or("0");
        let url = format!("{scheme}://{auth}{}:{}/{db}", config.host, config.port);
        let client = redis::Client::open(url).map_err(|e| PluginError::ConnectFailed {
            message: e.to_string(),
        })?;
        let conn = tokio::time::timeout(config.timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| PluginError::Timeout)?
            .map_err(|e| PluginError::ConnectFailed {
                message: e.to_string(),
            })?;
        Ok(Self { conn })
    }

    /// Run a command and decode straight into the expected type.
    async fn query<T: redis::FromRedisValue>(
        &self,
        ctx: &CallContext,
        cmd: redis::Cmd,
    ) -> Result<T, PluginError> {
        let mut conn = self.conn.clone();
        ctx.run(async move {
            cmd.query_async::<T>(&mut conn)
                .await
                .map_err(PluginError::from)
        })
        .await
    }
}

#[async_trait::async_trait]
impl RedisSource for RedisClientSource {
    async fn info(&self, ctx: &CallContext) -> Result<HashMap<String, String>, PluginError> {
        let raw: String = self.query(ctx, redis::cmd("INFO").to_owned()).await?;
        Ok(parse_info(&raw))
    }

    async fn config_entries(
        &self,
        ctx: &CallContext,
    ) -> Result<HashMap<String, String>, PluginError> {
        let mut cmd = redis::cmd("CONFIG");
        cmd.arg("GET").arg("*");
        let pairs: Vec<String> = self.query(ctx, cmd).await?;
        Ok(pairs
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect())
    }

    async fn slowlog(&self, ctx: &CallContext, limit: i64) -> Result<Vec<SlowLogEntry>, PluginError> {
        let mut cmd = redis::cmd("SLOWLOG");
        cmd.arg("GET").arg(limit);
        // SLOWLOG entries are heterogeneous nested arrays whose arity
        // varies by server version; decode the frame and pick fields out.
        let value: redis::Value = self.query(ctx, cmd).await?;
        Ok(parse_slowlog(&value))
    }

    async fn client_list(&self, ctx: &CallContext) -> Result<Vec<ConnectionInfo>, PluginError> {
        let mut cmd = redis::cmd("CLIENT");
        cmd.arg("LIST");
        let raw: String = self.query(ctx, cmd).await?;
        Ok(parse_client_list(&raw))
    }

    async fn ping(&self, ctx: &CallContext) -> Result<(), PluginError> {
        let pong: String = self.query(ctx, redis::cmd("PING").to_owned()).await?;
        if pong.eq_ignore_ascii_case("pong") {
            Ok(())
        } else {
            Err(PluginError::protocol(format!("unexpected PING reply: {pong}")))
        }
    }

    async fn run_command(
        &self,
        ctx: &CallContext,
        command: &Command,
    ) -> Result<serde_json::Value, PluginError> {
        let mut cmd = redis::cmd(&command.name);
        for arg in &command.args {
            cmd.arg(arg);
        }
        // Arbitrary commands have no fixed reply shape.
        let value: redis::Value = self.query(ctx, cmd).await?;
        Ok(redis_value_to_json(&value))
    }
}

fn parse_info(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_slowlog(value: &redis::Value) -> Vec<SlowLogEntry> {
    let redis::Value::Array(entries) = value else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let redis::Value::Array(fields) = entry else {
                return None;
            };
            let id = match fields.first()? {
                redis::Value::Int(id) => *id,
                _ => return None,
            };
            let unix_ts = match fields.get(1)? {
                redis::Value::Int(ts) => *ts,
                _ => return None,
            };
            let duration_us = match fields.get(2)? {
                redis::Value::Int(us) => (*us).max(0) as u64,
                _ => return None,
            };
            let statement = match fields.get(3)? {
                redis::Value::Array(args) => args
                    .iter()
                    .filter_map(|arg| match arg {
                        redis::Value::BulkString(bytes) => {
                            Some(String::from_utf8_lossy(bytes).into_owned())
                        }
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
                _ => return None,
            };
            let client = fields.get(4).and_then(|v| match v {
                redis::Value::BulkString(bytes) => {
                    Some(String::from_utf8_lossy(bytes).into_owned())
                }
                _ => None,
            });
            Some(SlowLogEntry {
                id,
                timestamp: Utc.timestamp_opt(unix_ts, 0).single().unwrap_or_else(Utc::now),
                duration_us,
                statement,
                client,
            })
        })
        .collect()
}

fn parse_client_list(raw: &str) -> Vec<ConnectionInfo> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: HashMap<&str, &str> = line
                .split_whitespace()
                .filter_map(|kv| kv.split_once('='))
                .collect();
            ConnectionInfo {
                id: fields.get("id").unwrap_or(&"").to_string(),
                client_addr: fields.get("addr").map(|s| s.to_string()),
                state: fields.get("cmd").unwrap_or(&"idle").to_string(),
                database: fields.get("db").map(|s| s.to_string()),
                age_seconds: fields.get("age").and_then(|s| s.parse().ok()),
            }
        })
        .collect()
}

fn redis_value_to_json(value: &redis::Value) -> serde_json::Value {
    match value {
        redis::Value::Nil => serde_json::Value::Null,
        redis::Value::Int(i) => serde_json::json!(i),
        redis::Value::Double(d) => serde_json::json!(d),
        redis::Value::Boolean(b) => serde_json::json!(b),
        redis::Value::BulkString(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        redis::Value::Array(items) | redis::Value::Set(items) => {
            serde_json::Value::Array(items.iter().map(redis_value_to_json).collect())
        }
        redis::Value::Map(pairs) => serde_json::Value::Array(
            pairs
                .iter()
                .map(|(k, v)| {
                    serde_json::json!({
                        "key": redis_value_to_json(k),
                        "value": redis_value_to_json(v),
                    })
                })
                .collect(),
        ),
        redis::Value::SimpleString(s) => serde_json::Value::String(s.clone()),
        redis::Value::Okay => serde_json::Value::String("OK".to_string()),
        // RESP3 frames with no JSON analogue (verbatim strings, big
        // numbers, pushes) degrade to their debug form.
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

/// Derive the metric set from flattened INFO output.
///
/// Invariants: `memory_usage_ratio` is present only when `maxmemory > 0`;
/// `hit_rate` only when `keyspace_hits + keyspace_misses > 0`;
/// `mem_fragmentation_ratio` is passed through untouched.
fn derive_metrics(info: &HashMap<String, String>) -> MetricsSnapshot {
    let mut builder = MetricsSnapshot::builder();

    for counter in [
        "used_memory",
        "maxmemory",
        "connected_clients",
        "blocked_clients",
        "instantaneous_ops_per_sec",
        "keyspace_hits",
        "keyspace_misses",
        "evicted_keys",
        "expired_keys",
        "total_commands_processed",
        "connected_slaves",
        "total_net_input_bytes",
        "total_net_output_bytes",
    ] {
        if let Some(v) = get_i64(info, counter) {
            builder.push(MetricValue::new(counter, v));
        }
    }

    if let Some(frag) = get_f64(info, "mem_fragmentation_ratio") {
        builder.push(MetricValue::new("mem_fragmentation_ratio", frag));
    }

    let used = get_f64(info, "used_memory");
    let max = get_f64(info, "maxmemory");
    if let (Some(used), Some(max)) = (used, max) {
        if max > 0.0 {
            builder.push(MetricValue::new("memory_usage_ratio", used / max).with_unit("ratio"));
        }
    }

    let hits = get_f64(info, "keyspace_hits").unwrap_or(0.0);
    let misses = get_f64(info, "keyspace_misses").unwrap_or(0.0);
    if hits + misses > 0.0 {
        builder.push(MetricValue::new("hit_rate", hits / (hits + misses)).with_unit("ratio"));
    }

    builder.build()
}

fn derive_replication(info: &HashMap<String, String>) -> Option<ReplicationStatus> {
    let role = info.get("role")?.clone();
    let connected_replicas = get_i64(info, "connected_slaves").unwrap_or(0).max(0) as u32;
    let (healthy, detail) = if role == "master" {
        (true, format!("master with {connected_replicas} replica(s)"))
    } else {
        let link = info
            .get("master_link_status")
            .map(String::as_str)
            .unwrap_or("unknown");
        (link == "up", format!("replica, master link {link}"))
    };
    Some(ReplicationStatus {
        role,
        healthy,
        io_running: None,
        sql_running: None,
        lag_seconds: get_i64(info, "master_last_io_seconds_ago"),
        connected_replicas,
        detail,
    })
}

pub struct RedisPlugin {
    source: RwLock<Option<Arc<dyn RedisSource>>>,
    /// Injected sources are pinned: connect verifies them instead of
    /// dialing a fresh client.
    injected: bool,
}

impl RedisPlugin {
    pub fn new() -> Self {
        Self {
            source: RwLock::new(None),
            injected: false,
        }
    }

    /// Build a plugin over a pre-connected source. Used by tests and by
    /// deployments that manage their own clients.
    pub fn with_source(source: Arc<dyn RedisSource>) -> Self {
        Self {
            source: RwLock::new(Some(source)),
            injected: true,
        }
    }

    async fn source(&self) -> Result<Arc<dyn RedisSource>, PluginError> {
        self.source
            .read()
            .await
            .clone()
            .ok_or(PluginError::NotConnected)
    }
}

impl Default for RedisPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MiddlewarePlugin for RedisPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: "redis-adapter".to_string(),
            name: "Redis Diagnostics".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            plugin_type: PluginType::Middleware,
            middleware_type: MiddlewareType::Redis,
            supported_versions: vec!["5".into(), "6".into(), "7".into()],
            capabilities: ["metrics", "slowlog", "replication", "config", "commands"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            requires: Default::default(),
        }
    }

    async fn connect(
        &self,
        ctx: &CallContext,
        config: &ConnectionConfig,
    ) -> Result<(), PluginError> {
        if self.injected {
            match self.source.read().await.clone() {
                Some(source) => return source.ping(ctx).await,
                None => return Err(PluginError::NotConnected),
            }
        }
        let source = Arc::new(RedisClientSource::connect(config).await?);
        *self.source.write().await = Some(source);
        tracing::info!(host = %config.host, port = config.port, "redis adapter connected");
        Ok(())
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
        let info = self.source().await?.info(ctx).await?;
        Ok(derive_metrics(&info))
    }

    async fn collect_specific_metric(
        &self,
        ctx: &CallContext,
        name: &str,
    ) -> Result<MetricValue, PluginError> {
        let snapshot = self.collect_metrics(ctx).await?;
        snapshot
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::collection(format!("metric not collected: {name}")))
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        command: Command,
    ) -> Result<CommandResult, PluginError> {
        ensure_not_denied(DENIED_COMMANDS, &command)?;
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
        let output = self.source().await?.run_command(&ctx, &command).await?;
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
                name: "INFO".into(),
                description: "Server statistics".into(),
                risk: 1,
            },
            CommandSpec {
                name: "PING".into(),
                description: "Liveness probe".into(),
                risk: 1,
            },
            CommandSpec {
                name: "DBSIZE".into(),
                description: "Key count for the selected database".into(),
                risk: 1,
            },
            CommandSpec {
                name: "SLOWLOG".into(),
                description: "Slow command log".into(),
                risk: 1,
            },
            CommandSpec {
                name: "MEMORY".into(),
                description: "Memory introspection".into(),
                risk: 2,
            },
            CommandSpec {
                name: "CLIENT".into(),
                description: "Client connection introspection".into(),
                risk: 2,
            },
        ]
    }

    async fn get_diagnostic_data(&self, ctx: &CallContext) -> Result<DiagnosticData, PluginError> {
        let source = self.source().await?;
        let info = source.info(ctx).await?;
        let metrics = derive_metrics(&info);
        let replication = derive_replication(&info);

        // Config, slowlog and client list are best-effort: a restricted
        // ACL must not abort the whole collection.
        let config = match source.config_entries(ctx).await {
            Ok(entries) => entries
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect(),
            Err(err) => {
                tracing::warn!(error = %err, "redis CONFIG GET failed; continuing without config");
                HashMap::new()
            }
        };
        let slow_logs = source.slowlog(ctx, SLOWLOG_FETCH).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "redis SLOWLOG failed; continuing without slowlog");
            Vec::new()
        });
        let connections = source.client_list(ctx).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "redis CLIENT LIST failed; continuing without clients");
            Vec::new()
        });

        let mut data = DiagnosticData::new(metrics);
        data.config = config;
        data.slow_logs = slow_logs;
        data.connections = connections;
        data.replication = replication;
        if let Some(version) = info.get("redis_version") {
            data.extra
                .insert("server_version".to_string(), serde_json::json!(version));
        }
        Ok(data)
    }

    fn builtin_rules(&self) -> Vec<DiagnosisRule> {
        vec![
            DiagnosisRule {
                id: "redis-memory-high".into(),
                name: "Memory Usage High".into(),
                severity: Severity::Warning,
                condition: "metrics.maxmemory > 0 && metrics.used_memory / metrics.maxmemory > 0.8"
                    .into(),
                message: "Memory usage is {{metrics.used_memory}} of {{metrics.maxmemory}} bytes"
                    .into(),
                suggestion: "Raise maxmemory or enable an eviction policy before writes stall"
                    .into(),
                tags: vec!["memory".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "redis-hit-rate-low".into(),
                name: "Cache Hit Rate Low".into(),
                severity: Severity::Warning,
                condition: "metrics.keyspace_hits + metrics.keyspace_misses > 1000 && metrics.hit_rate < 0.8"
                    .into(),
                message: "Cache hit rate dropped to {{metrics.hit_rate}}".into(),
                suggestion: "Review key TTLs and working-set size; cold keys thrash the cache"
                    .into(),
                tags: vec!["cache".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "redis-fragmentation-high".into(),
                name: "Memory Fragmentation High".into(),
                severity: Severity::Warning,
                condition: "metrics.mem_fragmentation_ratio > 1.5".into(),
                message: "Fragmentation ratio is {{metrics.mem_fragmentation_ratio}}".into(),
                suggestion: "Consider activedefrag or a rolling restart during low traffic".into(),
                tags: vec!["memory".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "redis-evictions".into(),
                name: "Keys Being Evicted".into(),
                severity: Severity::Warning,
                condition: "metrics.evicted_keys > 0".into(),
                message: "{{metrics.evicted_keys}} keys evicted under memory pressure".into(),
                suggestion: "Memory ceiling reached; widen maxmemory or shrink the working set"
                    .into(),
                tags: vec!["memory".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "redis-blocked-clients".into(),
                name: "Blocked Clients Present".into(),
                severity: Severity::Info,
                condition: "metrics.blocked_clients > 0".into(),
                message: "{{metrics.blocked_clients}} clients blocked on list/stream operations"
                    .into(),
                suggestion: String::new(),
                tags: vec!["clients".into()],
                enabled: true,
            },
        ]
    }
}

/// Registry factory for [`RedisPlugin`].
pub struct RedisPluginFactory;

impl PluginFactory for RedisPluginFactory {
    fn middleware_type(&self) -> MiddlewareType {
        MiddlewareType::Redis
    }

    fn create(&self, _config: &PluginConfig) -> Result<Arc<dyn MiddlewarePlugin>, PluginError> {
        Ok(Arc::new(RedisPlugin::new()))
    }
}
