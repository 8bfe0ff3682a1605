//! Plugin hooks around collection operations.
//!
//! Hooks fire `before -> SQL -> after`, with `on_error` on any failure in
//! those three. Plugins run sequentially in registration order. A hook
//! failure is logged and skipped in the default (lax) mode; in strict mode
//! it aborts the operation. Hook overruns against the configured budget are
//! detected after the hook returns (there is no preemption point in a
//! blocking call) and reported as `PluginTimeout`.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

use vellum_core::catalog::CollectionSchema;
use vellum_core::error::{Result, VellumError};
use vellum_core::value::DocValue;

/// The collection operation a hook fires around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Put,
    AtomicUpdate,
    Delete,
    Upsert,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Put => "put",
            Self::AtomicUpdate => "atomic_update",
            Self::Delete => "delete",
            Self::Upsert => "upsert",
        }
    }
}

/// Hook phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    Before,
    After,
    Error,
}

impl HookStage {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Error => "on_error",
        }
    }
}

/// Context handed to every hook invocation.
pub struct PluginContext<'a> {
    pub collection: &'a str,
    pub schema: &'a CollectionSchema,
    pub operation: Operation,
    /// The incoming document or operand, when the stage has one.
    pub data: Option<&'a DocValue>,
    /// The stored result, for `After` hooks.
    pub result: Option<&'a DocValue>,
    /// The failure being reported, for `Error` hooks.
    pub error: Option<&'a VellumError>,
}

/// A registered plugin. All methods default to no-ops so plugins implement
/// only the hooks they care about.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_before(&self, _ctx: &PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_after(&self, _ctx: &PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Observes failures. Infallible: an error hook that panics is a plugin
    /// bug; one that merely fails has nowhere further to report.
    fn on_error(&self, _ctx: &PluginContext<'_>) {}
}

/// Dispatches hooks across the registered plugins.
pub struct PluginManager {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    strict: bool,
    hook_budget: Option<Duration>,
}

impl PluginManager {
    pub fn new(strict: bool, hook_budget: Option<Duration>) -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            strict,
            hook_budget,
        }
    }

    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Runs one hook stage across all plugins, in registration order.
    ///
    /// Returns the first aborting error in strict mode; in lax mode plugin
    /// failures are routed to `on_error` and logged, and `Ok` is returned.
    pub fn execute_hook_safe(&self, stage: HookStage, ctx: &PluginContext<'_>) -> Result<()> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        for plugin in plugins.iter() {
            let started = Instant::now();
            let outcome = match stage {
                HookStage::Before => plugin.on_before(ctx),
                HookStage::After => plugin.on_after(ctx),
                HookStage::Error => {
                    plugin.on_error(ctx);
                    Ok(())
                }
            };

            let outcome = match (outcome, self.hook_budget) {
                (Ok(()), Some(budget)) if started.elapsed() > budget => {
                    Err(VellumError::PluginTimeout {
                        plugin: plugin.name().to_string(),
                        hook: format!("{}_{}", stage.as_str(), ctx.operation.as_str()),
                        budget_ms: budget.as_millis() as u64,
                    })
                }
                (outcome, _) => outcome.map_err(|e| match e {
                    e @ VellumError::PluginTimeout { .. } => e,
                    e => VellumError::Plugin {
                        plugin: plugin.name().to_string(),
                        hook: format!("{}_{}", stage.as_str(), ctx.operation.as_str()),
                        message: e.to_string(),
                    },
                }),
            };

            if let Err(e) = outcome {
                // Report the hook failure to the error hooks, then abort or
                // continue depending on strictness.
                if stage != HookStage::Error {
                    self.route_error(ctx, &e);
                }
                if self.strict {
                    return Err(e);
                }
                warn!(plugin = plugin.name(), error = %e, "plugin hook failed");
            }
        }
        Ok(())
    }

    /// Fires `on_error` across all plugins for a failed operation.
    pub fn route_error(&self, ctx: &PluginContext<'_>, error: &VellumError) {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        let error_ctx = PluginContext {
            collection: ctx.collection,
            schema: ctx.schema,
            operation: ctx.operation,
            data: ctx.data,
            result: ctx.result,
            error: Some(error),
        };
        for plugin in plugins.iter() {
            plugin.on_error(&error_ctx);
        }
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vellum_core::shape::Shape;

    struct Recording {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
        fail_before: bool,
    }

    impl Plugin for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_before(&self, ctx: &PluginContext<'_>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:before:{}", self.name, ctx.operation.as_str()));
            if self.fail_before {
                Err(VellumError::validation("boom"))
            } else {
                Ok(())
            }
        }

        fn on_after(&self, _ctx: &PluginContext<'_>) -> Result<()> {
            self.calls.lock().unwrap().push(format!("{}:after", self.name));
            Ok(())
        }

        fn on_error(&self, _ctx: &PluginContext<'_>) {
            self.calls.lock().unwrap().push(format!("{}:error", self.name));
        }
    }

    fn ctx_schema() -> CollectionSchema {
        CollectionSchema::new("users", Shape::permissive()).unwrap()
    }

    fn ctx<'a>(schema: &'a CollectionSchema) -> PluginContext<'a> {
        PluginContext {
            collection: "users",
            schema,
            operation: Operation::Insert,
            data: None,
            result: None,
            error: None,
        }
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = PluginManager::new(false, None);
        for name in ["first", "second"] {
            manager.register(Arc::new(Recording {
                name: name.into(),
                calls: Arc::clone(&calls),
                fail_before: false,
            }));
        }
        let schema = ctx_schema();
        manager.execute_hook_safe(HookStage::Before, &ctx(&schema)).unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["first:before:insert", "second:before:insert"]
        );
    }

    #[test]
    fn lax_mode_routes_failures_and_continues() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = PluginManager::new(false, None);
        manager.register(Arc::new(Recording {
            name: "bad".into(),
            calls: Arc::clone(&calls),
            fail_before: true,
        }));
        manager.register(Arc::new(Recording {
            name: "good".into(),
            calls: Arc::clone(&calls),
            fail_before: false,
        }));

        let schema = ctx_schema();
        manager.execute_hook_safe(HookStage::Before, &ctx(&schema)).unwrap();

        let seen = calls.lock().unwrap().clone();
        // The failure was routed to every on_error hook, then the second
        // plugin's before hook still ran.
        assert!(seen.contains(&"bad:error".to_string()));
        assert!(seen.contains(&"good:error".to_string()));
        assert!(seen.contains(&"good:before:insert".to_string()));
    }

    #[test]
    fn strict_mode_aborts_on_hook_failure() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = PluginManager::new(true, None);
        manager.register(Arc::new(Recording {
            name: "bad".into(),
            calls: Arc::clone(&calls),
            fail_before: true,
        }));
        manager.register(Arc::new(Recording {
            name: "never".into(),
            calls: Arc::clone(&calls),
            fail_before: false,
        }));

        let schema = ctx_schema();
        let err = manager
            .execute_hook_safe(HookStage::Before, &ctx(&schema))
            .unwrap_err();
        assert_eq!(err.kind(), "plugin");

        let seen = calls.lock().unwrap().clone();
        assert!(!seen.iter().any(|c| c.starts_with("never:before")));
    }

    struct Slow;

    impl Plugin for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn on_before(&self, _ctx: &PluginContext<'_>) -> Result<()> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        }
    }

    #[test]
    fn overrunning_hook_reports_timeout_in_strict_mode() {
        let manager = PluginManager::new(true, Some(Duration::from_millis(1)));
        manager.register(Arc::new(Slow));
        let schema = ctx_schema();
        let err = manager
            .execute_hook_safe(HookStage::Before, &ctx(&schema))
            .unwrap_err();
        assert_eq!(err.kind(), "plugin_timeout");
    }
}
