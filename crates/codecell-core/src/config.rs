//! Service and runtime configuration.
//!
//! Defaults can be overridden from the environment with
//! [`ServiceConfig::from_env`]:
//!
//! - `CODECELL_PYTHON` - interpreter path
//! - `CODECELL_PACKAGES` - comma-separated package set loaded at bootstrap
//! - `CODECELL_ABORT_GRACE_MS` - how long a cancelled run waits for the worker
//! - `CODECELL_SHARED_INTERRUPT` - `0`/`false` disables the shared interrupt cell

use std::path::PathBuf;
use std::time::Duration;

/// Packages every runtime loads before the support script.
pub const DEFAULT_PACKAGES: &[&str] = &["numpy", "matplotlib", "pandas", "tqdm"];

/// Grace period between sending an abort and settling the run locally.
pub const DEFAULT_ABORT_GRACE: Duration = Duration::from_millis(100);

/// How often a running job checks the interrupt cell.
pub const DEFAULT_INTERRUPT_POLL: Duration = Duration::from_millis(10);

/// Execution service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long a cancelled run waits for the worker's acknowledgement.
    pub abort_grace: Duration,
    /// Whether to share an interrupt cell with the worker. When disabled,
    /// cancellation relies on abort messages alone.
    pub shared_interrupt: bool,
    /// Python runtime settings.
    pub python: PythonConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            abort_grace: DEFAULT_ABORT_GRACE,
            shared_interrupt: true,
            python: PythonConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from a variable lookup. Malformed values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("CODECELL_PYTHON").filter(|p| !p.trim().is_empty()) {
            self.python.interpreter = Some(PathBuf::from(path));
        }

        if let Some(packages) = lookup("CODECELL_PACKAGES") {
            self.python.packages = packages
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(raw) = lookup("CODECELL_ABORT_GRACE_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.abort_grace = Duration::from_millis(ms),
                Err(e) => tracing::warn!("ignoring CODECELL_ABORT_GRACE_MS={:?}: {}", raw, e),
            }
        }

        if let Some(raw) = lookup("CODECELL_SHARED_INTERRUPT") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.shared_interrupt = true,
                "0" | "false" | "no" => self.shared_interrupt = false,
                other => tracing::warn!("ignoring CODECELL_SHARED_INTERRUPT={:?}", other),
            }
        }
    }
}

/// Python runtime configuration.
#[derive(Debug, Clone)]
pub struct PythonConfig {
    /// Interpreter to launch. Resolved from `PATH` when `None`.
    pub interpreter: Option<PathBuf>,
    /// Packages imported at bootstrap. A missing package fails the bootstrap.
    pub packages: Vec<String>,
    /// Working directory of the interpreter.
    pub working_dir: Option<PathBuf>,
    /// Interrupt cell polling interval while a job runs.
    pub interrupt_poll: Duration,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            packages: DEFAULT_PACKAGES.iter().map(|p| p.to_string()).collect(),
            working_dir: None,
            interrupt_poll: DEFAULT_INTERRUPT_POLL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.abort_grace, Duration::from_millis(100));
        assert!(config.shared_interrupt);
        assert_eq!(config.python.packages, vec!["numpy", "matplotlib", "pandas", "tqdm"]);
        assert!(config.python.interpreter.is_none());
    }

    #[test]
    fn test_overrides() {
        let mut config = ServiceConfig::default();
        config.apply_overrides(lookup(&[
            ("CODECELL_PYTHON", "/opt/py/bin/python3"),
            ("CODECELL_PACKAGES", "numpy, tqdm,,"),
            ("CODECELL_ABORT_GRACE_MS", "250"),
            ("CODECELL_SHARED_INTERRUPT", "false"),
        ]));

        assert_eq!(
            config.python.interpreter,
            Some(PathBuf::from("/opt/py/bin/python3"))
        );
        assert_eq!(config.python.packages, vec!["numpy", "tqdm"]);
        assert_eq!(config.abort_grace, Duration::from_millis(250));
        assert!(!config.shared_interrupt);
    }

    #[test]
    fn test_malformed_values_are_ignored() {
        let mut config = ServiceConfig::default();
        config.apply_overrides(lookup(&[
            ("CODECELL_ABORT_GRACE_MS", "soon"),
            ("CODECELL_SHARED_INTERRUPT", "maybe"),
        ]));
        assert_eq!(config.abort_grace, DEFAULT_ABORT_GRACE);
        assert!(config.shared_interrupt);
    }

    #[test]
    fn test_empty_package_list_is_allowed() {
        let mut config = ServiceConfig::default();
        config.apply_overrides(lookup(&[("CODECELL_PACKAGES", "")]));
        assert!(config.python.packages.is_empty());
    }
}
