//! Active environment resolution.
//!
//! The environment name selects the store namespace pending deliveries are
//! written to. Providers are queried on every use, never cached, so a change
//! of environment is visible to callbacks that fire after it.

use std::sync::{Arc, PoisonError, RwLock};

/// Variable read by [`ProcessEnvironment::default`].
pub const DEFAULT_ENVIRONMENT_VAR: &str = "APP_PROFILE";

/// Environment used when the variable is unset or empty.
pub const DEFAULT_ENVIRONMENT: &str = "dev";

/// Source of the active environment name.
pub trait EnvironmentProvider: Send + Sync {
    fn active_environment(&self) -> String;
}

impl<T: EnvironmentProvider + ?Sized> EnvironmentProvider for Arc<T> {
    fn active_environment(&self) -> String {
        (**self).active_environment()
    }
}

/// Reads the environment name from a process environment variable.
#[derive(Debug, Clone)]
pub struct ProcessEnvironment {
    var: String,
    fallback: String,
}

impl ProcessEnvironment {
    pub fn new(var: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            fallback: fallback.into(),
        }
    }
}

impl Default for ProcessEnvironment {
    fn default() -> Self {
        Self::new(DEFAULT_ENVIRONMENT_VAR, DEFAULT_ENVIRONMENT)
    }
}

impl EnvironmentProvider for ProcessEnvironment {
    fn active_environment(&self) -> String {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => value,
            _ => self.fallback.clone(),
        }
    }
}

/// A fixed environment name.
#[derive(Debug, Clone)]
pub struct StaticEnvironment(String);

impl StaticEnvironment {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl EnvironmentProvider for StaticEnvironment {
    fn active_environment(&self) -> String {
        self.0.clone()
    }
}

/// An environment name that can be switched at runtime.
///
/// Clones share the same name.
#[derive(Debug, Clone)]
pub struct SharedEnvironment(Arc<RwLock<String>>);

impl SharedEnvironment {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(name.into())))
    }

    pub fn set(&self, name: impl Into<String>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = name.into();
    }
}

impl EnvironmentProvider for SharedEnvironment {
    fn active_environment(&self) -> String {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_falls_back() {
        let env = ProcessEnvironment::new("COURIER_TEST_SURELY_UNSET_VARIABLE", "staging");
        assert_eq!(env.active_environment(), "staging");
    }

    #[test]
    fn default_process_environment_reads_app_profile() {
        let env = ProcessEnvironment::default();
        let expected = std::env::var(DEFAULT_ENVIRONMENT_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_owned());
        assert_eq!(env.active_environment(), expected);
    }

    #[test]
    fn shared_environment_switches_for_all_clones() {
        let env = SharedEnvironment::new("dev");
        let observer = env.clone();

        env.set("prod");

        assert_eq!(observer.active_environment(), "prod");
    }

    #[test]
    fn providers_work_behind_arc() {
        let env: Arc<dyn EnvironmentProvider> = Arc::new(StaticEnvironment::new("qa"));
        assert_eq!(env.active_environment(), "qa");
    }
}
