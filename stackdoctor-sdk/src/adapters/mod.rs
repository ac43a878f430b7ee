//! Reference middleware adapters.
//!
//! Each adapter implements [`MiddlewarePlugin`](crate::plugin::MiddlewarePlugin)
//! over an injectable *source* trait so the wire protocol stays at the
//! boundary: the Redis source speaks RESP through the `redis` crate, the
//! Elasticsearch source speaks HTTP through `reqwest`, and the
//! MySQL/Kafka/PostgreSQL sources are integration points the deployment
//! provides (tests inject fakes). Derived-metric arithmetic lives in pure
//! functions per adapter and is unit-tested without I/O.

use crate::error::PluginError;
use crate::models::Command;
use std::collections::HashMap;

pub mod elasticsearch;
pub mod kafka;
pub mod mysql;
pub mod postgres;
pub mod redis;

pub use elasticsearch::{ElasticsearchPlugin, ElasticsearchPluginFactory, ElasticsearchSource};
pub use kafka::{KafkaPlugin, KafkaPluginFactory, KafkaSource};
pub use mysql::{MysqlPlugin, MysqlPluginFactory, MysqlSource};
pub use postgres::{PostgresPlugin, PostgresPluginFactory, PostgresSource};
pub use redis::{RedisPlugin, RedisPluginFactory, RedisSource};

/// Look up a key in a string map and parse it as f64.
pub(crate) fn get_f64(map: &HashMap<String, String>, key: &str) -> Option<f64> {
    map.get(key).and_then(|v| v.trim().parse::<f64>().ok())
}

/// Look up a key in a string map and parse it as i64.
pub(crate) fn get_i64(map: &HashMap<String, String>, key: &str) -> Option<i64> {
    map.get(key).and_then(|v| v.trim().parse::<i64>().ok())
}

/// Reject commands on the adapter's deny list. Matching is on the first
/// word of the command name, case-insensitive.
pub(crate) fn ensure_not_denied(denied: &[&str], command: &Command) -> Result<(), PluginError> {
    let head = command
        .name
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if denied.iter().any(|d| d.eq_ignore_ascii_case(&head)) {
        return Err(PluginError::NotAllowed {
            operation: command.name.clone(),
        });
    }
    Ok(())
}
