use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a secondary object points back at the primary objects it affects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    /// `metadata.ownerReferences` entries of the primary kind.
    OwnerReference,
    /// Label whose value is the name of the primary object in the same namespace.
    Label(String),
    /// Every known primary object in the secondary object's namespace.
    Namespace,
}

impl Default for Relationship {
    fn default() -> Self { Relationship::OwnerReference }
}

impl FromStr for Relationship {
    type Err = ConfigError;

    /// `owner`, `namespace` or `label:<key>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" | "owner-reference" => Ok(Relationship::OwnerReference),
            "namespace" => Ok(Relationship::Namespace),
            other => match other.strip_prefix("label:") {
                Some(key) if !key.is_empty() => Ok(Relationship::Label(key.to_string())),
                _ => Err(ConfigError::Relationship(s.to_string())),
            },
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relationship::OwnerReference => write!(f, "owner"),
            Relationship::Namespace => write!(f, "namespace"),
            Relationship::Label(key) => write!(f, "label:{key}"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("workers must be at least 1")]
    NoWorkers,
    #[error("backoff base must be non-zero and not above the cap ({base:?} > {max:?})")]
    Backoff { base: Duration, max: Duration },
    #[error("channel capacity must be at least 1")]
    ChannelCapacity,
    #[error("invalid relationship {0:?} (expect owner, namespace or label:<key>)")]
    Relationship(String),
}

/// Controller engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Kind name of the primary resource, e.g. `Labeler`.
    pub primary_kind: String,
    pub workers: usize,
    /// When true no status sub-resource write happens after a reconcile.
    pub skip_status_updates: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Capacity of each inbound event channel.
    pub channel_capacity: usize,
    pub relationship: Relationship,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            primary_kind: "Labeler".to_string(),
            workers: 2,
            skip_status_updates: true,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            channel_capacity: 1024,
            relationship: Relationship::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            return Err(ConfigError::Backoff { base: self.backoff_base, max: self.backoff_max });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ChannelCapacity);
        }
        Ok(())
    }
}
