//! Controller configuration

use crate::crd::parse_interval;
use std::time::Duration;

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Configuration for the ObjectTemplate controller
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Field manager name used for server-side apply
    pub field_manager: String,
    /// Maximum number of ObjectTemplates reconciled in parallel
    pub max_concurrent_reconciles: usize,
    /// Maximum width of the per-pass render/apply/delete fan-out
    pub max_parallelism: usize,
    /// Requeue delay when a pass could not even persist its status
    pub error_requeue: Duration,
    /// Restrict the controller to ObjectTemplates in this namespace
    pub namespace: Option<String>,
    /// Path to kubeconfig file (None = inferred config)
    pub kubeconfig_path: Option<String>,
    /// Kubeconfig context to use (None = current-context)
    pub context: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            field_manager: "template-controller".to_string(),
            max_concurrent_reconciles: 4,
            max_parallelism: 32,
            error_requeue: Duration::from_secs(30),
            namespace: None,
            kubeconfig_path: None,
            context: None,
        }
    }
}

/// Builder for ControllerConfig
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
        }
    }

    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.config.field_manager = field_manager.into();
        self
    }

    pub fn max_concurrent_reconciles(mut self, max: usize) -> Self {
        self.config.max_concurrent_reconciles = max;
        self
    }

    pub fn max_parallelism(mut self, max: usize) -> Self {
        self.config.max_parallelism = max;
        self
    }

    pub fn error_requeue(mut self, delay: Duration) -> Self {
        self.config.error_requeue = delay;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = Some(namespace.into());
        self
    }

    pub fn kubeconfig_path(mut self, path: impl Into<String>) -> Self {
        self.config.kubeconfig_path = Some(path.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.config.context = Some(context.into());
        self
    }

    /// Build the configuration, validating required fields
    pub fn build(self) -> Result<ControllerConfig, ConfigError> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.config.field_manager.trim().is_empty() {
            return Err(ConfigError::new("field manager cannot be empty"));
        }
        if self.config.max_concurrent_reconciles == 0 {
            return Err(ConfigError::new(
                "max concurrent reconciles must be at least 1",
            ));
        }
        if self.config.max_parallelism == 0 {
            return Err(ConfigError::new("max parallelism must be at least 1"));
        }
        if matches!(&self.config.namespace, Some(ns) if ns.is_empty()) {
            return Err(ConfigError::new("namespace cannot be empty when set"));
        }
        Ok(())
    }
}

impl Default for ControllerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerConfig {
    /// Create a new builder
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::new()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut builder = ControllerConfigBuilder::new();

        if let Some(field_manager) = lookup("TEMPLATE_CONTROLLER_FIELD_MANAGER") {
            builder = builder.field_manager(field_manager);
        }

        if let Some(value) = lookup("TEMPLATE_CONTROLLER_MAX_CONCURRENT_RECONCILES") {
            let max = value.parse().map_err(|_| {
                ConfigError::new(format!("invalid max concurrent reconciles {:?}", value))
            })?;
            builder = builder.max_concurrent_reconciles(max);
        }

        if let Some(value) = lookup("TEMPLATE_CONTROLLER_MAX_PARALLELISM") {
            let max = value
                .parse()
                .map_err(|_| ConfigError::new(format!("invalid max parallelism {:?}", value)))?;
            builder = builder.max_parallelism(max);
        }

        if let Some(value) = lookup("TEMPLATE_CONTROLLER_ERROR_REQUEUE") {
            let delay = parse_interval(&value).map_err(|e| ConfigError::new(e.to_string()))?;
            builder = builder.error_requeue(delay);
        }

        if let Some(namespace) = lookup("TEMPLATE_CONTROLLER_NAMESPACE") {
            builder = builder.namespace(namespace);
        }

        if let Some(path) = lookup("TEMPLATE_CONTROLLER_KUBECONFIG") {
            builder = builder.kubeconfig_path(path);
        }

        if let Some(context) = lookup("TEMPLATE_CONTROLLER_CONTEXT") {
            builder = builder.context(context);
        }

        builder.build()
    }
}
