//! Rebuild hook registry.
//!
//! Hooks are caller-supplied behaviors invoked after every logged change.
//! The registry preserves registration order, and the orchestrator runs
//! each enabled hook independently: one hook's failure is recorded and the
//! rest still run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use keeper_core::changelog::ChangeLogEntry;
use keeper_core::event::ChangeEvent;
use parking_lot::RwLock;
use std::process::Command;
use std::sync::Arc;

#[async_trait]
pub trait RebuildHook: Send + Sync {
    async fn handle(&self, event: &ChangeEvent, entry: &ChangeLogEntry) -> Result<()>;
}

#[derive(Clone)]
pub struct HookRegistration {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    hook: Arc<dyn RebuildHook>,
}

impl HookRegistration {
    pub fn hook(&self) -> Arc<dyn RebuildHook> {
        self.hook.clone()
    }
}

#[derive(Default)]
pub struct HookRegistry {
    inner: RwLock<Vec<HookRegistration>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        description: &str,
        hook: Arc<dyn RebuildHook>,
    ) -> Result<()> {
        let mut hooks = self.inner.write();
        if hooks.iter().any(|h| h.name == name) {
            anyhow::bail!("hook already registered: {name}");
        }
        hooks.push(HookRegistration {
            name: name.to_string(),
            description: description.to_string(),
            enabled: true,
            hook,
        });
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut hooks = self.inner.write();
        let before = hooks.len();
        hooks.retain(|h| h.name != name);
        hooks.len() != before
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut hooks = self.inner.write();
        match hooks.iter_mut().find(|h| h.name == name) {
            Some(hook) => {
                hook.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().iter().map(|h| h.name.clone()).collect()
    }

    /// Registrations in registration order, for invocation.
    pub fn snapshot(&self) -> Vec<HookRegistration> {
        self.inner.read().clone()
    }
}

/// Hook that shells out to a rebuild command. The changed path and change
/// kind are exposed through `KEEPER_CHANGED_PATH` / `KEEPER_CHANGE_KIND`.
pub struct CommandHook {
    program: String,
    args: Vec<String>,
}

impl CommandHook {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl RebuildHook for CommandHook {
    async fn handle(&self, event: &ChangeEvent, _entry: &ChangeLogEntry) -> Result<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .env("KEEPER_CHANGED_PATH", &event.path)
            .env("KEEPER_CHANGE_KIND", event.kind.as_str())
            .output()
            .with_context(|| format!("spawn rebuild command '{}'", self.program))?;
        if !output.status.success() {
            anyhow::bail!(
                "rebuild command '{}' failed: {}",
                self.program,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl RebuildHook for Noop {
        async fn handle(&self, _event: &ChangeEvent, _entry: &ChangeLogEntry) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registration_order_is_preserved() {
        let registry = HookRegistry::new();
        registry.register("first", "", Arc::new(Noop)).unwrap();
        registry.register("second", "", Arc::new(Noop)).unwrap();
        registry.register("third", "", Arc::new(Noop)).unwrap();
        assert_eq!(registry.names(), vec!["first", "second", "third"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = HookRegistry::new();
        registry.register("rebuild", "", Arc::new(Noop)).unwrap();
        assert!(registry.register("rebuild", "", Arc::new(Noop)).is_err());
    }

    #[test]
    fn unregister_and_toggle() {
        let registry = HookRegistry::new();
        registry.register("rebuild", "", Arc::new(Noop)).unwrap();
        assert!(registry.set_enabled("rebuild", false));
        assert!(!registry.snapshot()[0].enabled);
        assert!(registry.unregister("rebuild"));
        assert!(!registry.unregister("rebuild"));
        assert!(!registry.set_enabled("rebuild", true));
    }
}
