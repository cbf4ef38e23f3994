use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ip::cidr::is_valid_pool;
use crate::ip::registry::{AddressPool, AllocationRegistry, RegistryError, RegistryKind};
use crate::orchestrator::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};

/// Top-level configuration for the allocator CLI
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IpamConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Where registry records live
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// Root directory of the file store
    pub path: PathBuf,
    /// Namespace holding the registry record
    pub namespace: String,
}

/// Which registry to use and how to bootstrap it
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegistryConfig {
    pub kind: RegistryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl IpamConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.store.path.as_os_str().is_empty() {
            return Err(ValidationError::InvalidStore("path cannot be empty".to_string()));
        }
        if self.store.namespace.trim().is_empty() {
            return Err(ValidationError::InvalidStore("namespace cannot be empty".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ValidationError::InvalidRetry(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        is_valid_pool(self.registry.pool())
            .map_err(|e| ValidationError::InvalidRegistry(e.to_string()))?;
        self.initial_registry()
            .map_err(|e| ValidationError::InvalidRegistry(e.to_string()))?;

        Ok(())
    }

    /// Registry written by `init`
    pub fn initial_registry(&self) -> Result<AllocationRegistry, RegistryError> {
        let pool = AddressPool::new(self.registry.pool(), self.registry.allocation_size())?;
        Ok(AllocationRegistry::new(pool, self.registry.enabled.unwrap_or(true)))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
        }
    }
}

impl RegistryConfig {
    /// Configured pool, or the default for the registry kind
    pub fn pool(&self) -> &str {
        self.pool.as_deref().unwrap_or_else(|| self.kind.default_pool())
    }

    pub fn allocation_size(&self) -> u64 {
        self.allocation_size
            .unwrap_or_else(|| self.kind.default_allocation_size())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid store configuration: {0}")]
    InvalidStore(String),
    #[error("Invalid registry configuration: {0}")]
    InvalidRegistry(String),
    #[error("Invalid retry configuration: {0}")]
    InvalidRetry(String),
}

/// Default implementations
impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::Globalnet,
            pool: None,
            allocation_size: None,
            enabled: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parsing() {
        let yaml = r#"
store:
  path: /var/lib/clusterset-ipam
  namespace: broker-ns
registry:
  kind: clusterset_ip
  pool: 243.10.0.0/16
  allocation_size: 1024
  enabled: true
retry:
  max_attempts: 7
"#;
        let config: IpamConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.kind, RegistryKind::ClustersetIp);
        assert_eq!(config.retry_policy().max_attempts, 7);

        let registry = config.initial_registry().unwrap();
        assert_eq!(registry.pool.cidr.to_string(), "243.10.0.0/16");
        assert_eq!(registry.pool.allocation_size, 1024);
        assert!(registry.enabled);
    }

    #[test]
    fn test_defaults_per_kind() {
        let yaml = r#"
store:
  path: /tmp/ipam
  namespace: broker-ns
"#;
        let config: IpamConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.kind, RegistryKind::Globalnet);
        assert_eq!(config.registry.pool(), "242.0.0.0/8");
        assert_eq!(config.registry.allocation_size(), 65536);
        assert_eq!(config.retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_invalid_configs() {
        let base = r#"
store:
  path: /tmp/ipam
  namespace: broker-ns
"#;
        let mut config: IpamConfig = serde_yaml::from_str(base).unwrap();
        config.registry.pool = Some("127.0.0.0/8".to_string());
        assert!(matches!(config.validate(), Err(ValidationError::InvalidRegistry(_))));

        let mut config: IpamConfig = serde_yaml::from_str(base).unwrap();
        config.registry.allocation_size = Some(1 << 24);
        assert!(matches!(config.validate(), Err(ValidationError::InvalidRegistry(_))));

        let mut config: IpamConfig = serde_yaml::from_str(base).unwrap();
        config.store.namespace = " ".to_string();
        assert!(matches!(config.validate(), Err(ValidationError::InvalidStore(_))));

        let mut config: IpamConfig = serde_yaml::from_str(base).unwrap();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ValidationError::InvalidRetry(_))));
    }

    #[test]
    fn test_missing_store_section_fails_to_parse() {
        let yaml = "registry:\n  kind: globalnet\n";
        assert!(serde_yaml::from_str::<IpamConfig>(yaml).is_err());
    }
}
