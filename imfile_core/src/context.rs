use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::command::{CommandRunner, ShellRunner};
use crate::config::Policy;
use crate::error::{ImageError, Result};
use crate::foreign::FormatProbe;
use crate::registry::CompressionRegistry;

enum RegistrySource {
    None,
    File(PathBuf),
    Text(String),
}

/// Process-scoped state shared by image sessions: the compression registry,
/// session policy, the command runner, foreign-format probes and the
/// last-error message.
///
/// The registry is loaded on first use. A failed load is remembered and
/// returned to every later caller without retrying.
pub struct Context {
    source: RegistrySource,
    registry: OnceLock<std::result::Result<CompressionRegistry, String>>,
    policy: Policy,
    runner: Arc<dyn CommandRunner>,
    probes: Vec<Arc<dyn FormatProbe>>,
    last_error: Mutex<String>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Context with default policy, the shell runner and no registry.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub(crate) fn probes(&self) -> &[Arc<dyn FormatProbe>] {
        &self.probes
    }

    pub fn registry(&self) -> Result<&CompressionRegistry> {
        let loaded = self.registry.get_or_init(|| {
            let result = match &self.source {
                RegistrySource::None => Err(ImageError::compression("no compression config configured")),
                RegistrySource::File(path) => {
                    debug!(path = %path.display(), "loading compression registry");
                    CompressionRegistry::load(path)
                }
                RegistrySource::Text(text) => CompressionRegistry::parse(text),
            };
            result.map_err(|e| match e {
                ImageError::Compression(msg) => msg,
                other => other.to_string(),
            })
        });
        loaded
            .as_ref()
            .map_err(|msg| ImageError::Compression(msg.clone()))
    }

    /// Message of the most recent failed operation, empty if none failed yet.
    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Record the error of a failed operation and pass the result through.
    pub(crate) fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            debug!(error = %e, "image operation failed");
            let mut buf = self
                .last_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *buf = e.to_string();
        }
        result
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    source: Option<RegistrySource>,
    registry: Option<CompressionRegistry>,
    policy: Policy,
    runner: Option<Arc<dyn CommandRunner>>,
    probes: Vec<Arc<dyn FormatProbe>>,
}

impl ContextBuilder {
    /// Load the registry from this config file on first use.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(RegistrySource::File(path.into()));
        self
    }

    /// Parse the registry from config text on first use.
    pub fn config_text(mut self, text: impl Into<String>) -> Self {
        self.source = Some(RegistrySource::Text(text.into()));
        self
    }

    pub fn registry(mut self, registry: CompressionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn runner(mut self, runner: impl CommandRunner + 'static) -> Self {
        self.runner = Some(Arc::new(runner));
        self
    }

    /// Register a foreign-format probe. Probes are tried in insertion order
    /// before the native format.
    pub fn probe(mut self, probe: impl FormatProbe + 'static) -> Self {
        self.probes.push(Arc::new(probe));
        self
    }

    pub fn build(self) -> Arc<Context> {
        let registry = OnceLock::new();
        if let Some(ready) = self.registry {
            let _ = registry.set(Ok(ready));
        }
        Arc::new(Context {
            source: self.source.unwrap_or(RegistrySource::None),
            registry,
            policy: self.policy,
            runner: self.runner.unwrap_or_else(|| Arc::new(ShellRunner)),
            probes: self.probes,
            last_error: Mutex::new(String::new()),
        })
    }
}
