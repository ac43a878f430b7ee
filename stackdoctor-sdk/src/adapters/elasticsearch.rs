use crate::adapters::ensure_not_denied;
use crate::context::CallContext;
use crate::error::PluginError;
use crate::models::{
    Command, CommandResult, CommandSpec, DiagnosisRule, DiagnosticData, HealthStatus, MetricValue,
    MetricsSnapshot, Severity,
};
use crate::plugin::{
    ConnectionConfig, MiddlewarePlugin, MiddlewareType, PluginConfig, PluginFactory, PluginInfo,
    PluginType,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

const DENIED_OPERATIONS: &[&str] = &["DELETE-INDEX", "CLOSE-INDEX", "DELETE-SNAPSHOT"];

/// Disk usage above this fraction marks the node unhealthy.
const DISK_UNHEALTHY_WATERMARK: f64 = 0.90;
/// Disk usage above this fraction degrades the node.
const DISK_DEGRADED_WATERMARK: f64 = 0.85;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub cluster_name: String,
    pub status: String,
    pub number_of_nodes: u32,
    pub number_of_data_nodes: u32,
    pub active_primary_shards: u32,
    pub active_shards: u32,
    pub relocating_shards: u32,
    pub initializing_shards: u32,
    pub unassigned_shards: u32,
    #[serde(default)]
    pub pending_tasks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFsStats {
    pub name: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl NodeFsStats {
    /// Disk usage as `1 − avail/total`. Zero-sized filesystems report
    /// full usage.
    pub fn usage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        1.0 - self.available_bytes as f64 / self.total_bytes as f64
    }

    pub fn health(&self) -> HealthStatus {
        let usage = self.usage();
        if usage > DISK_UNHEALTHY_WATERMARK {
            HealthStatus::Unhealthy
        } else if usage > DISK_DEGRADED_WATERMARK {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Wire-level access used by the adapter. The production implementation
/// is [`HttpElasticsearchSource`]; tests inject fakes.
#[async_trait::async_trait]
pub trait ElasticsearchSource: Send + Sync {
    async fn cluster_health(&self, ctx: &CallContext) -> Result<ClusterHealth, PluginError>;

    async fn nodes_fs(&self, ctx: &CallContext) -> Result<Vec<NodeFsStats>, PluginError>;

    async fn ping(&self, ctx: &CallContext) -> Result<(), PluginError>;

    async fn run_request(
        &self,
        ctx: &CallContext,
        command: &Command,
    ) -> Result<serde_json::Value, PluginError>;
}

/// REST source over `reqwest`.
pub struct HttpElasticsearchSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpElasticsearchSource {
    pub fn new(config: &ConnectionConfig) -> Result<Self, PluginError> {
        let scheme = if config.tls { "https" } else { "http" };
        let base_url = format!("{scheme}://{}:{}", config.host, config.port);
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            let mut headers = reqwest::header::HeaderMap::new();
            let token = base64_basic(user, pass);
            let value = reqwest::header::HeaderValue::from_str(&format!("Basic {token}"))
                .map_err(|e| PluginError::invalid(e.to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        let client = builder.build().map_err(|e| PluginError::ConnectFailed {
            message: e.to_string(),
        })?;
        Ok(Self { client, base_url })
    }

    async fn get_json(
        &self,
        ctx: &CallContext,
        path: &str,
    ) -> Result<serde_json::Value, PluginError> {
        let url = format!("{}{path}", self.base_url);
        let client = self.client.clone();
        ctx.run(async move {
            let response = client.get(&url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(PluginError::protocol(format!(
                    "elasticsearch returned {status} for {url}"
                )));
            }
            Ok(response.json::<serde_json::Value>().await?)
        })
        .await
    }
}

fn base64_basic(user: &str, pass: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
}

#[async_trait::async_trait]
impl ElasticsearchSource for HttpElasticsearchSource {
    async fn cluster_health(&self, ctx: &CallContext) -> Result<ClusterHealth, PluginError> {
        let body = self.get_json(ctx, "/_cluster/health").await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn nodes_fs(&self, ctx: &CallContext) -> Result<Vec<NodeFsStats>, PluginError> {
        let body = self.get_json(ctx, "/_nodes/stats/fs").await?;
        let nodes = body
            .get("nodes")
            .and_then(|n| n.as_object())
            .ok_or_else(|| PluginError::protocol("missing nodes object in fs stats"))?;
        Ok(nodes
            .values()
            .filter_map(|node| {
                let name = node.get("name")?.as_str()?.to_string();
                let total = node.pointer("/fs/total/total_in_bytes")?.as_u64()?;
                let available = node.pointer("/fs/total/available_in_bytes")?.as_u64()?;
                Some(NodeFsStats {
                    name,
                    total_bytes: total,
                    available_bytes: available,
                })
            })
            .collect())
    }

    async fn ping(&self, ctx: &CallContext) -> Result<(), PluginError> {
        self.get_json(ctx, "/").await.map(|_| ())
    }

    async fn run_request(
        &self,
        ctx: &CallContext,
        command: &Command,
    ) -> Result<serde_json::Value, PluginError> {
        // Command name is the path, e.g. `_cat/indices?format=json`.
        let path = if command.name.starts_with('/') {
            command.name.clone()
        } else {
            format!("/{}", command.name)
        };
        self.get_json(ctx, &path).await
    }
}

/// Map the cluster color to adapter health.
pub fn status_health(status: &str) -> HealthStatus {
    match status.to_ascii_lowercase().as_str() {
        "green" => HealthStatus::Healthy,
        "yellow" => HealthStatus::Degraded,
        _ => HealthStatus::Unhealthy,
    }
}

fn derive_metrics(health: &ClusterHealth, nodes: &[NodeFsStats]) -> MetricsSnapshot {
    let mut builder = MetricsSnapshot::builder();
    builder.push(MetricValue::new("number_of_nodes", i64::from(health.number_of_nodes)));
    builder.push(MetricValue::new(
        "number_of_data_nodes",
        i64::from(health.number_of_data_nodes),
    ));
    builder.push(MetricValue::new("active_shards", i64::from(health.active_shards)));
    builder.push(MetricValue::new(
        "active_primary_shards",
        i64::from(health.active_primary_shards),
    ));
    builder.push(MetricValue::new(
        "relocating_shards",
        i64::from(health.relocating_shards),
    ));
    builder.push(MetricValue::new(
        "initializing_shards",
        i64::from(health.initializing_shards),
    ));
    builder.push(MetricValue::new(
        "unassigned_shards",
        i64::from(health.unassigned_shards),
    ));
    builder.push(MetricValue::new("pending_tasks", i64::from(health.pending_tasks)));
    builder.push(MetricValue::new(
        "status_code",
        match status_health(&health.status) {
            HealthStatus::Healthy => 0i64,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        },
    ));

    if let Some(worst) = nodes
        .iter()
        .map(|n| n.usage())
        .max_by(|a, b| a.total_cmp(b))
    {
        builder.push(MetricValue::new("max_disk_usage", worst).with_unit("ratio"));
    }
    builder.build()
}

pub struct ElasticsearchPlugin {
    source: RwLock<Option<Arc<dyn ElasticsearchSource>>>,
    /// Injected sources are pinned: connect verifies them instead of
    /// building a fresh HTTP client.
    injected: bool,
}

impl ElasticsearchPlugin {
    pub fn new() -> Self {
        Self {
            source: RwLock::new(None),
            injected: false,
        }
    }

    pub fn with_source(source: Arc<dyn ElasticsearchSource>) -> Self {
        Self {
            source: RwLock::new(Some(source)),
            injected: true,
        }
    }

    async fn source(&self) -> Result<Arc<dyn ElasticsearchSource>, PluginError> {
        self.source
            .read()
            .await
            .clone()
            .ok_or(PluginError::NotConnected)
    }
}

impl Default for ElasticsearchPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MiddlewarePlugin for ElasticsearchPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: "elasticsearch-adapter".to_string(),
            name: "Elasticsearch Diagnostics".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            plugin_type: PluginType::Middleware,
            middleware_type: MiddlewareType::Elasticsearch,
            supported_versions: vec!["7.x".into(), "8.x".into()],
            capabilities: ["metrics", "cluster-health", "disk-watermarks", "commands"]
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
        let source = Arc::new(HttpElasticsearchSource::new(config)?);
        source.ping(ctx).await.map_err(|e| PluginError::ConnectFailed {
            message: e.to_string(),
        })?;
        *self.source.write().await = Some(source);
        tracing::info!(host = %config.host, port = config.port, "elasticsearch adapter connected");
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
        let source = self.source().await?;
        let health = source.cluster_health(ctx).await?;
        let nodes = source.nodes_fs(ctx).await.unwrap_or_default();
        Ok(derive_metrics(&health, &nodes))
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        command: Command,
    ) -> Result<CommandResult, PluginError> {
        ensure_not_denied(DENIED_OPERATIONS, &command)?;
        if command.dry_run {
            return Ok(CommandResult {
                success: true,
                output: None,
                message: format!("dry run: would request {}", command.name),
                dry_run: true,
            });
        }
        let ctx = match command.timeout {
            Some(timeout) => ctx.child_with_timeout(timeout),
            None => ctx.child(),
        };
        let output = self.source().await?.run_request(&ctx, &command).await?;
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
                name: "_cluster/health".into(),
                description: "Cluster health summary".into(),
                risk: 1,
            },
            CommandSpec {
                name: "_cat/indices".into(),
                description: "Index inventory".into(),
                risk: 1,
            },
            CommandSpec {
                name: "_nodes/stats".into(),
                description: "Per-node statistics".into(),
                risk: 1,
            },
            CommandSpec {
                name: "_cluster/reroute".into(),
                description: "Manual shard reroute".into(),
                risk: 4,
            },
        ]
    }

    async fn get_diagnostic_data(&self, ctx: &CallContext) -> Result<DiagnosticData, PluginError> {
        let source = self.source().await?;
        let health = source.cluster_health(ctx).await?;
        let nodes = source.nodes_fs(ctx).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "elasticsearch fs stats failed; continuing without them");
            Vec::new()
        });
        let metrics = derive_metrics(&health, &nodes);

        let mut data = DiagnosticData::new(metrics);
        data.extra.insert(
            "health".to_string(),
            serde_json::to_value(status_health(&health.status))?,
        );
        data.extra
            .insert("cluster_status".to_string(), serde_json::json!(health.status));
        data.extra
            .insert("nodes_fs".to_string(), serde_json::to_value(&nodes)?);
        Ok(data)
    }

    fn builtin_rules(&self) -> Vec<DiagnosisRule> {
        vec![
            DiagnosisRule {
                id: "es-cluster-red".into(),
                name: "Cluster Status Red".into(),
                severity: Severity::Critical,
                condition: "metrics.status_code == 2".into(),
                message: "Cluster status is red: primary shards unassigned".into(),
                suggestion: "Inspect unassigned shards with _cluster/allocation/explain".into(),
                tags: vec!["availability".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "es-cluster-yellow".into(),
                name: "Cluster Status Yellow".into(),
                severity: Severity::Warning,
                condition: "metrics.status_code == 1".into(),
                message: "Cluster status is yellow: replica shards unassigned".into(),
                suggestion: "Verify node count covers the configured replica factor".into(),
                tags: vec!["availability".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "es-disk-critical".into(),
                name: "Disk Watermark Exceeded".into(),
                severity: Severity::Critical,
                condition: "metrics.max_disk_usage > 0.90".into(),
                message: "A node is at {{metrics.max_disk_usage}} disk usage".into(),
                suggestion: "Free disk or add nodes before shards become read-only".into(),
                tags: vec!["disk".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "es-disk-high".into(),
                name: "Disk Usage High".into(),
                severity: Severity::Warning,
                condition: "metrics.max_disk_usage > 0.85 && metrics.max_disk_usage <= 0.90".into(),
                message: "A node is at {{metrics.max_disk_usage}} disk usage".into(),
                suggestion: "Plan capacity: the flood-stage watermark is approaching".into(),
                tags: vec!["disk".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "es-unassigned-shards".into(),
                name: "Unassigned Shards Present".into(),
                severity: Severity::Warning,
                condition: "metrics.unassigned_shards > 0".into(),
                message: "{{metrics.unassigned_shards}} shards unassigned".into(),
                suggestion: String::new(),
                tags: vec!["shards".into()],
                enabled: true,
            },
        ]
    }
}

/// Registry factory for [`ElasticsearchPlugin`].
pub struct ElasticsearchPluginFactory;

impl PluginFactory for ElasticsearchPluginFactory {
    fn middleware_type(&self) -> MiddlewareType {
        MiddlewareType::Elasticsearch
    }

    fn create(&self, _config: &PluginConfig) -> Result<Arc<dyn MiddlewarePlugin>, PluginError> {
        Ok(Arc::new(ElasticsearchPlugin::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(status_health("green"), HealthStatus::Healthy);
        assert_eq!(status_health("YELLOW"), HealthStatus::Degraded);
        assert_eq!(status_health("red"), HealthStatus::Unhealthy);
        assert_eq!(status_health("purple"), HealthStatus::Unhealthy);
    }

    #[test]
    fn disk_watermarks() {
        let node = |available: u64| NodeFsStats {
            name: "node-1".into(),
            total_bytes: 100,
            available_bytes: available,
        };
        assert_eq!(node(50).health(), HealthStatus::Healthy);
        // usage 0.86 -> degraded
        assert_eq!(node(14).health(), HealthStatus::Degraded);
        // usage 0.95 -> unhealthy
        assert_eq!(node(5).health(), HealthStatus::Unhealthy);
        // boundary: exactly 0.85 stays healthy, exactly 0.90 stays degraded
        assert_eq!(node(15).health(), HealthStatus::Healthy);
        assert_eq!(node(10).health(), HealthStatus::Degraded);
    }

    #[test]
    fn zero_sized_filesystem_counts_as_full() {
        let node = NodeFsStats {
            name: "node-1".into(),
            total_bytes: 0,
            available_bytes: 0,
        };
        assert_eq!(node.usage(), 1.0);
        assert_eq!(node.health(), HealthStatus::Unhealthy);
    }

    #[test]
    fn metrics_capture_worst_node_disk() {
        let health = ClusterHealth {
            cluster_name: "test".into(),
            status: "yellow".into(),
            number_of_nodes: 2,
            number_of_data_nodes: 2,
            active_primary_shards: 5,
            active_shards: 8,
            relocating_shards: 0,
            initializing_shards: 0,
            unassigned_shards: 2,
            pending_tasks: 0,
        };
        let nodes = vec![
            NodeFsStats {
                name: "a".into(),
                total_bytes: 100,
                available_bytes: 40,
            },
            NodeFsStats {
                name: "b".into(),
                total_bytes: 100,
                available_bytes: 8,
            },
        ];
        let metrics = derive_metrics(&health, &nodes);
        assert!((metrics.value("max_disk_usage").unwrap() - 0.92).abs() < 1e-9);
        assert_eq!(metrics.value("status_code"), Some(1.0));
        assert_eq!(metrics.value("unassigned_shards"), Some(2.0));
    }

    #[test]
    fn basic_auth_encoding() {
        // "user:pass" encodes to the canonical base64 form.
        assert_eq!(base64_basic("user", "pass"), "dXNlcjpwYXNz");
        assert_eq!(base64_basic("a", "b"), "YTpi");
    }

    #[tokio::test]
    async fn index_deletion_is_denied() {
        let plugin = ElasticsearchPlugin::new();
        let res = plugin
            .execute(&CallContext::background(), Command::new("DELETE-INDEX logs-2024"))
            .await;
        assert!(matches!(res, Err(PluginError::NotAllowed { .. })));
    }
}
