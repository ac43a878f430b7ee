//! # Sandboxed Plugin Execution
//!
//! Plugin actions run through a [`Sandbox`] that enforces three things:
//!
//! 1. **Allow-list** — an operation not on the list is rejected with
//!    [`PluginError::NotAllowed`] before the plugin is ever invoked.
//! 2. **Deadline** — the action is raced against the sandbox timeout and
//!    the caller's context.
//! 3. **Panic recovery** — the action runs on its own task; a panic is
//!    caught at the join boundary and surfaced as
//!    [`PluginError::ExecutionPanic`] carrying the recovered payload.
//!
//! The configured memory limit is advisory: it is recorded and exposed so
//! deployment layers (cgroups, container limits) can enforce it, but the
//! sandbox itself does not meter allocations.

use crate::common::parse_memory_size;
use crate::context::CallContext;
use crate::error::PluginError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Per-action execution deadline.
    #[serde(with = "crate::common::duration_serde")]
    pub timeout: Duration,
    /// Advisory memory ceiling, e.g. `"256Mi"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    /// Operation names this sandbox will execute.
    #[serde(default)]
    pub allowed_operations: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            memory_limit: Some("256Mi".to_string()),
            allowed_operations: vec![
                "ping".to_string(),
                "collect_metrics".to_string(),
                "get_diagnostic_data".to_string(),
            ],
        }
    }
}

pub struct Sandbox {
    timeout: Duration,
    memory_limit_bytes: Option<u64>,
    allowed: HashSet<String>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Result<Self, PluginError> {
        let memory_limit_bytes = match &config.memory_limit {
            Some(s) => Some(parse_memory_size(s).map_err(PluginError::invalid)?),
            None => None,
        };
        Ok(Self {
            timeout: config.timeout,
            memory_limit_bytes,
            allowed: config.allowed_operations.into_iter().collect(),
        })
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_bytes
    }

    pub fn is_allowed(&self, operation: &str) -> bool {
        self.allowed.contains(operation)
    }

    /// Execute `action` under the sandbox policy.
    pub async fn execute<F, T>(
        &self,
        ctx: &CallContext,
        operation: &str,
        action: F,
    ) -> Result<T, PluginError>
    where
        F: Future<Output = Result<T, PluginError>> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_allowed(operation) {
            tracing::warn!(operation, "sandbox rejected disallowed operation");
            return Err(PluginError::NotAllowed {
                operation: operation.to_string(),
            });
        }

        let child = ctx.child_with_timeout(self.timeout);
        let deadline = child
            .deadline()
            .expect("child_with_timeout always sets a deadline");
        let mut task = tokio::spawn(action);

        tokio::select! {
            _ = tokio::time::sleep_until(deadline.into()) => {
                task.abort();
                child.cancel();
                tracing::warn!(operation, "sandboxed action timed out");
                Err(PluginError::Timeout)
            }
            _ = ctx.cancelled() => {
                task.abort();
                child.cancel();
                Err(PluginError::Cancelled)
            }
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    let message = recover_panic_message(err);
                    tracing::error!(operation, panic = %message, "sandboxed action panicked");
                    Err(PluginError::ExecutionPanic { message })
                }
                Err(_) => Err(PluginError::Cancelled),
            },
        }
    }
}

fn recover_panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "opaque panic payload".to_string()
            }
        }
        Err(_) => "task aborted".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_allowing(ops: &[&str]) -> Sandbox {
        Sandbox::new(SandboxConfig {
            timeout: Duration::from_millis(100),
            memory_limit: Some("64Mi".to_string()),
            allowed_operations: ops.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn disallowed_operation_is_rejected_without_running() {
        let sandbox = sandbox_allowing(&["ping"]);
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_inner = std::sync::Arc::clone(&ran);

        let res = sandbox
            .execute(&CallContext::background(), "flush_all", async move {
                ran_inner.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(res, Err(PluginError::NotAllowed { .. })));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn allowed_operation_runs() {
        let sandbox = sandbox_allowing(&["ping"]);
        let res = sandbox
            .execute(&CallContext::background(), "ping", async { Ok(42) })
            .await;
        assert_eq!(res.unwrap(), 42);
    }

    #[tokio::test]
    async fn panic_surfaces_with_payload() {
        let sandbox = sandbox_allowing(&["ping"]);
        let res: Result<(), _> = sandbox
            .execute(&CallContext::background(), "ping", async {
                panic!("adapter exploded");
            })
            .await;
        match res {
            Err(PluginError::ExecutionPanic { message }) => {
                assert!(message.contains("adapter exploded"))
            }
            other => panic!("expected ExecutionPanic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_applies() {
        let sandbox = sandbox_allowing(&["ping"]);
        let res: Result<(), _> = sandbox
            .execute(&CallContext::background(), "ping", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(PluginError::Timeout)));
    }

    #[test]
    fn memory_limit_is_parsed() {
        let sandbox = sandbox_allowing(&[]);
        assert_eq!(sandbox.memory_limit_bytes(), Some(64 * 1024 * 1024));

        let bad = Sandbox::new(SandboxConfig {
            timeout: Duration::from_secs(1),
            memory_limit: Some("many".to_string()),
            allowed_operations: vec![],
        });
        assert!(bad.is_err());
    }
}
