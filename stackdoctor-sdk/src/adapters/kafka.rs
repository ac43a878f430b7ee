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
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Admin operations the Kafka adapter refuses to forward.
const DENIED_OPERATIONS: &[&str] = &["DELETE-TOPIC", "DELETE-RECORDS", "DELETE-GROUP"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub log_end_offset: i64,
}

impl PartitionMetadata {
    /// A partition is under-replicated iff the in-sync set is smaller
    /// than the replica set.
    pub fn is_under_replicated(&self) -> bool {
        self.isr.len() < self.replicas.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub broker_count: u32,
    pub controller_id: i32,
    pub topics: Vec<TopicMetadata>,
}

/// One committed offset for a consumer group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOffset {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    pub committed_offset: i64,
}

/// Wire-level access used by the adapter. Deployments provide an
/// implementation over their Kafka client of choice; tests inject fakes.
#[async_trait::async_trait]
pub trait KafkaSource: Send + Sync {
    async fn cluster_metadata(&self, ctx: &CallContext) -> Result<ClusterMetadata, PluginError>;

    async fn consumer_groups(&self, ctx: &CallContext) -> Result<Vec<String>, PluginError>;

    async fn group_offsets(
        &self,
        ctx: &CallContext,
        group: &str,
    ) -> Result<Vec<GroupOffset>, PluginError>;

    async fn ping(&self, ctx: &CallContext) -> Result<(), PluginError>;

    async fn run_admin(
        &self,
        ctx: &CallContext,
        command: &Command,
    ) -> Result<serde_json::Value, PluginError>;
}

/// Total consumer lag across all committed offsets: negative per-partition
/// lag (committed ahead of the log end) clamps to zero.
fn total_lag(cluster: &ClusterMetadata, offsets: &[GroupOffset]) -> i64 {
    let mut end_offsets: HashMap<(&str, i32), i64> = HashMap::new();
    for topic in &cluster.topics {
        for partition in &topic.partitions {
            end_offsets.insert((topic.name.as_str(), partition.id), partition.log_end_offset);
        }
    }
    offsets
        .iter()
        .filter_map(|o| {
            let end = end_offsets.get(&(o.topic.as_str(), o.partition))?;
            Some((end - o.committed_offset).max(0))
        })
        .sum()
}

fn under_replicated_count(cluster: &ClusterMetadata) -> u32 {
    cluster
        .topics
        .iter()
        .flat_map(|t| &t.partitions)
        .filter(|p| p.is_under_replicated())
        .count() as u32
}

fn derive_metrics(cluster: &ClusterMetadata, lag: i64) -> MetricsSnapshot {
    let partition_count: i64 = cluster.topics.iter().map(|t| t.partitions.len() as i64).sum();
    let mut builder = MetricsSnapshot::builder();
    builder.push(MetricValue::new("broker_count", i64::from(cluster.broker_count)));
    builder.push(MetricValue::new("topic_count", cluster.topics.len() as i64));
    builder.push(MetricValue::new("partition_count", partition_count));
    builder.push(MetricValue::new(
        "under_replicated_partitions",
        i64::from(under_replicated_count(cluster)),
    ));
    builder.push(MetricValue::new("total_lag", lag).with_unit("messages"));
    builder.build()
}

/// Overall cluster health: any under-replicated partition degrades the
/// cluster; an empty broker set is unhealthy.
pub fn cluster_health(cluster: &ClusterMetadata) -> HealthStatus {
    if cluster.broker_count == 0 {
        return HealthStatus::Unhealthy;
    }
    if under_replicated_count(cluster) > 0 {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

pub struct KafkaPlugin {
    source: RwLock<Option<Arc<dyn KafkaSource>>>,
}

impl KafkaPlugin {
    pub fn new() -> Self {
        Self {
            source: RwLock::new(None),
        }
    }

    pub fn with_source(source: Arc<dyn KafkaSource>) -> Self {
        Self {
            source: RwLock::new(Some(source)),
        }
    }

    pub async fn attach_source(&self, source: Arc<dyn KafkaSource>) {
        *self.source.write().await = Some(source);
    }

    async fn source(&self) -> Result<Arc<dyn KafkaSource>, PluginError> {
        self.source
            .read()
            .await
            .clone()
            .ok_or(PluginError::NotConnected)
    }

    async fn collect_lag(
        &self,
        ctx: &CallContext,
        source: &Arc<dyn KafkaSource>,
        cluster: &ClusterMetadata,
    ) -> Result<i64, PluginError> {
        let groups = source.consumer_groups(ctx).await?;
        let mut lag = 0i64;
        for group in &groups {
            let offsets = source.group_offsets(ctx, group).await?;
            lag += total_lag(cluster, &offsets);
        }
        Ok(lag)
    }
}

impl Default for KafkaPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MiddlewarePlugin for KafkaPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: "kafka-adapter".to_string(),
            name: "Kafka Diagnostics".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            plugin_type: PluginType::Middleware,
            middleware_type: MiddlewareType::Kafka,
            supported_versions: vec!["2.8".into(), "3.x".into()],
            capabilities: ["metrics", "consumer-lag", "isr", "commands"]
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
                message: "kafka adapter requires an injected KafkaSource".to_string(),
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
        let cluster = source.cluster_metadata(ctx).await?;
        let lag = self.collect_lag(ctx, &source, &cluster).await?;
        Ok(derive_metrics(&cluster, lag))
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
                message: format!("dry run: would execute {}", command.name),
                dry_run: true,
            });
        }
        let ctx = match command.timeout {
            Some(timeout) => ctx.child_with_timeout(timeout),
            None => ctx.child(),
        };
        let output = self.source().await?.run_admin(&ctx, &command).await?;
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
                name: "LIST-TOPICS".into(),
                description: "Topic inventory".into(),
                risk: 1,
            },
            CommandSpec {
                name: "DESCRIBE-TOPIC".into(),
                description: "Partition and replica layout".into(),
                risk: 1,
            },
            CommandSpec {
                name: "DESCRIBE-GROUP".into(),
                description: "Consumer group members and offsets".into(),
                risk: 1,
            },
            CommandSpec {
                name: "ALTER-CONFIG".into(),
                description: "Change a topic or broker config entry".into(),
                risk: 4,
            },
        ]
    }

    async fn get_diagnostic_data(&self, ctx: &CallContext) -> Result<DiagnosticData, PluginError> {
        let source = self.source().await?;
        let cluster = source.cluster_metadata(ctx).await?;
        let lag = self
            .collect_lag(ctx, &source, &cluster)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "kafka lag collection failed; reporting zero lag");
                0
            });
        let metrics = derive_metrics(&cluster, lag);

        let mut data = DiagnosticData::new(metrics);
        data.extra.insert(
            "health".to_string(),
            serde_json::to_value(cluster_health(&cluster))?,
        );
        data.extra
            .insert("cluster".to_string(), serde_json::to_value(&cluster)?);
        Ok(data)
    }

    fn builtin_rules(&self) -> Vec<DiagnosisRule> {
        vec![
            DiagnosisRule {
                id: "kafka-under-replicated".into(),
                name: "Partitions Under-Replicated".into(),
                severity: Severity::Warning,
                condition: "metrics.under_replicated_partitions > 0".into(),
                message: "{{metrics.under_replicated_partitions}} partitions under-replicated"
                    .into(),
                suggestion: "Check broker availability and replica fetcher throughput".into(),
                tags: vec!["replication".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "kafka-consumer-lag-high".into(),
                name: "Consumer Lag High".into(),
                severity: Severity::Warning,
                condition: "metrics.total_lag > 100000".into(),
                message: "Total consumer lag is {{metrics.total_lag}} messages".into(),
                suggestion: "Scale consumers or inspect slow message handlers".into(),
                tags: vec!["consumers".into()],
                enabled: true,
            },
            DiagnosisRule {
                id: "kafka-no-brokers".into(),
                name: "No Brokers Visible".into(),
                severity: Severity::Critical,
                condition: "metrics.broker_count == 0".into(),
                message: "Cluster metadata reports zero live brokers".into(),
                suggestion: "The cluster is unreachable or down; check broker processes".into(),
                tags: vec!["availability".into()],
                enabled: true,
            },
        ]
    }
}

/// Registry factory for [`KafkaPlugin`].
pub struct KafkaPluginFactory;

impl PluginFactory for KafkaPluginFactory {
    fn middleware_type(&self) -> MiddlewareType {
        MiddlewareType::Kafka
    }

    fn create(&self, _config: &PluginConfig) -> Result<Arc<dyn MiddlewarePlugin>, PluginError> {
        Ok(Arc::new(KafkaPlugin::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(id: i32, replicas: Vec<i32>, isr: Vec<i32>, leo: i64) -> PartitionMetadata {
        PartitionMetadata {
            id,
            leader: replicas.first().copied().unwrap_or(-1),
            replicas,
            isr,
            log_end_offset: leo,
        }
    }

    fn cluster(topics: Vec<TopicMetadata>) -> ClusterMetadata {
        ClusterMetadata {
            broker_count: 3,
            controller_id: 1,
            topics,
        }
    }

    #[test]
    fn under_replicated_iff_isr_smaller_than_replicas() {
        assert!(partition(0, vec![1, 2], vec![1], 0).is_under_replicated());
        assert!(!partition(0, vec![1, 2], vec![1, 2], 0).is_under_replicated());
    }

    #[test]
    fn total_lag_clamps_negative_partition_lag() {
        let cluster = cluster(vec![TopicMetadata {
            name: "topic1".into(),
            partitions: vec![
                partition(0, vec![1], vec![1], 100),
                partition(1, vec![2], vec![2], 50),
            ],
        }]);
        let offsets = vec![
            GroupOffset {
                group: "g".into(),
                topic: "topic1".into(),
                partition: 0,
                committed_offset: 60,
            },
            // Committed ahead of the log end; contributes zero, not -10.
            GroupOffset {
                group: "g".into(),
                topic: "topic1".into(),
                partition: 1,
                committed_offset: 60,
            },
        ];
        assert_eq!(total_lag(&cluster, &offsets), 40);
    }

    #[test]
    fn offsets_for_unknown_partitions_are_ignored() {
        let cluster = cluster(vec![]);
        let offsets = vec![GroupOffset {
            group: "g".into(),
            topic: "ghost".into(),
            partition: 0,
            committed_offset: 10,
        }];
        assert_eq!(total_lag(&cluster, &offsets), 0);
    }

    #[test]
    fn health_degrades_on_under_replication() {
        let degraded = cluster(vec![TopicMetadata {
            name: "topic1".into(),
            partitions: vec![partition(0, vec![1, 2], vec![1], 0)],
        }]);
        assert_eq!(cluster_health(&degraded), HealthStatus::Degraded);

        let healthy = cluster(vec![TopicMetadata {
            name: "topic1".into(),
            partitions: vec![partition(0, vec![1, 2], vec![1, 2], 0)],
        }]);
        assert_eq!(cluster_health(&healthy), HealthStatus::Healthy);

        let empty = ClusterMetadata {
            broker_count: 0,
            controller_id: -1,
            topics: vec![],
        };
        assert_eq!(cluster_health(&empty), HealthStatus::Unhealthy);
    }

    #[test]
    fn metrics_include_under_replicated_count() {
        let cluster = cluster(vec![TopicMetadata {
            name: "topic1".into(),
            partitions: vec![
                partition(0, vec![1, 2], vec![1], 10),
                partition(1, vec![1, 2], vec![1, 2], 10),
            ],
        }]);
        let metrics = derive_metrics(&cluster, 42);
        assert_eq!(metrics.value("under_replicated_partitions"), Some(1.0));
        assert_eq!(metrics.value("partition_count"), Some(2.0));
        assert_eq!(metrics.value("total_lag"), Some(42.0));
    }

    #[tokio::test]
    async fn destructive_admin_operations_are_denied() {
        let plugin = KafkaPlugin::new();
        let res = plugin
            .execute(&CallContext::background(), Command::new("DELETE-TOPIC orders"))
            .await;
        assert!(matches!(res, Err(PluginError::NotAllowed { .. })));
    }
}
