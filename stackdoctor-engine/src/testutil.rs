//! Shared test fixtures: a scriptable in-memory plugin.

use stackdoctor_sdk::context::CallContext;
use stackdoctor_sdk::error::PluginError;
use stackdoctor_sdk::models::{
    Command, CommandResult, CommandSpec, DiagnosisRule, DiagnosticData, MetricValue,
    MetricsSnapshot,
};
use stackdoctor_sdk::plugin::{
    ConnectionConfig, MiddlewarePlugin, MiddlewareType, PluginConfig, PluginFactory, PluginInfo,
    PluginType,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) fn static_plugin_config() -> PluginConfig {
    PluginConfig {
        middleware_type: MiddlewareType::Other("static".to_string()),
        connection: ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: 9999,
            ..Default::default()
        },
        options: Default::default(),
        enabled: true,
        priority: 0,
    }
}

/// An in-memory plugin whose behavior is scripted by the test.
pub(crate) struct StaticPlugin {
    connected: AtomicBool,
    fail_connect: AtomicBool,
    /// Fail this many pings before succeeding again.
    fail_pings: AtomicU32,
    pub ping_count: AtomicU32,
    fail_data: AtomicBool,
    data: Mutex<DiagnosticData>,
    rules: Mutex<Vec<DiagnosisRule>>,
}

impl StaticPlugin {
    pub fn healthy() -> Self {
        Self {
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_pings: AtomicU32::new(0),
            ping_count: AtomicU32::new(0),
            fail_data: AtomicBool::new(false),
            data: Mutex::new(DiagnosticData::new(MetricsSnapshot::empty())),
            rules: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_connect() -> Self {
        let plugin = Self::healthy();
        plugin.fail_connect.store(true, Ordering::SeqCst);
        plugin
    }

    pub fn fail_next_pings(&self, count: u32) {
        self.fail_pings.store(count, Ordering::SeqCst);
    }

    pub fn set_metrics(&self, metrics: &[(&str, f64)]) {
        let mut builder = MetricsSnapshot::builder();
        for (name, value) in metrics {
            builder.push(MetricValue::new(*name, *value));
        }
        self.data.lock().unwrap().metrics = builder.build();
    }

    pub fn set_data(&self, data: DiagnosticData) {
        *self.data.lock().unwrap() = data;
    }

    pub fn set_rules(&self, rules: Vec<DiagnosisRule>) {
        *self.rules.lock().unwrap() = rules;
    }

    pub fn fail_diagnostic_data(&self, fail: bool) {
        self.fail_data.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl MiddlewarePlugin for StaticPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: "static-plugin".to_string(),
            name: "Static Test Plugin".to_string(),
            version: "0.0.0".to_string(),
            plugin_type: PluginType::Middleware,
            middleware_type: MiddlewareType::Other("static".to_string()),
            supported_versions: vec![],
            capabilities: Default::default(),
            requires: Default::default(),
        }
    }

    async fn connect(
        &self,
        _ctx: &CallContext,
        _config: &ConnectionConfig,
    ) -> Result<(), PluginError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(PluginError::ConnectFailed {
                message: "scripted connect failure".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self, _ctx: &CallContext) -> Result<(), PluginError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, _ctx: &CallContext) -> Result<(), PluginError> {
        self.ping_count.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_pings.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_pings.store(remaining - 1, Ordering::SeqCst);
            return Err(PluginError::Disconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn collect_metrics(&self, _ctx: &CallContext) -> Result<MetricsSnapshot, PluginError> {
        Ok(self.data.lock().unwrap().metrics.clone())
    }

    async fn execute(
        &self,
        _ctx: &CallContext,
        command: Command,
    ) -> Result<CommandResult, PluginError> {
        Ok(CommandResult {
            success: true,
            output: Some(serde_json::json!({"echo": command.name})),
            message: String::new(),
            dry_run: command.dry_run,
        })
    }

    fn supported_commands(&self) -> Vec<CommandSpec> {
        vec![CommandSpec {
            name: "ECHO".to_string(),
            description: "Echo the command back".to_string(),
            risk: 1,
        }]
    }

    async fn get_diagnostic_data(&self, _ctx: &CallContext) -> Result<DiagnosticData, PluginError> {
        if self.fail_data.load(Ordering::SeqCst) {
            return Err(PluginError::collection("scripted collection failure"));
        }
        Ok(self.data.lock().unwrap().clone())
    }

    fn builtin_rules(&self) -> Vec<DiagnosisRule> {
        self.rules.lock().unwrap().clone()
    }
}

pub(crate) struct StaticPluginFactory {
    fail_connect: bool,
    /// Factory-created plugins are recorded here so tests can script them.
    pub created: Mutex<Vec<Arc<StaticPlugin>>>,
}

impl StaticPluginFactory {
    pub fn healthy() -> Self {
        Self {
            fail_connect: false,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_connect() -> Self {
        Self {
            fail_connect: true,
            created: Mutex::new(Vec::new()),
        }
    }
}

impl PluginFactory for StaticPluginFactory {
    fn middleware_type(&self) -> MiddlewareType {
        MiddlewareType::Other("static".to_string())
    }

    fn create(&self, _config: &PluginConfig) -> Result<Arc<dyn MiddlewarePlugin>, PluginError> {
        let plugin = Arc::new(if self.fail_connect {
            StaticPlugin::failing_connect()
        } else {
            StaticPlugin::healthy()
        });
        self.created.lock().unwrap().push(Arc::clone(&plugin));
        Ok(plugin)
    }
}
