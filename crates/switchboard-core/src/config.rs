//! Configuration types
//!
//! Every field has a default, so an empty document is a valid configuration
//! with no agents. The binary layers files and `SWITCHBOARD_*` variables on
//! top with the `config` crate and deserializes into [`SwitchboardConfig`].

use crate::connector::ConnectorConfig;
use crate::error::{Error, Result};
use crate::init::AgentEndpoint;
use crate::stream::DedupPolicy;
use crate::supervisor::SupervisorConfig;
use crate::task::TaskConfig;
use crate::utils::{RetryBudget, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    /// Router settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Per-call timeouts
    #[serde(default)]
    pub connector: ConnectorConfig,
    /// Reflection retry budget and backoff
    #[serde(default)]
    pub retry: RetrySettings,
    /// Receiving-side task engine
    #[serde(default)]
    pub tasks: TaskConfig,
    /// Event stream consumption
    #[serde(default)]
    pub stream: StreamConfig,
    /// Startup
    #[serde(default)]
    pub init: InitConfig,
    /// Sub-agents to bring up
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Retry settings in configuration units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries per class
    #[serde(default)]
    pub budget: RetryBudget,
    /// First backoff delay (milliseconds)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff cap (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff growth factor
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Randomize delays
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            budget: RetryBudget::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    /// The runtime retry configuration
    #[must_use]
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_budget(self.budget)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_jitter(self.jitter)
    }
}

/// Event stream settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    /// When a final status message counts as noise
    #[serde(default)]
    pub dedup: DedupPolicy,
}

/// Startup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    /// Default bound on descriptor discovery per agent (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// One configured sub-agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Expected descriptor id
    pub id: String,
    /// Base URL of its RPC surface
    pub address: String,
    /// Overrides `init.connect_timeout_secs`
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl SwitchboardConfig {
    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(Error::Configuration("agent id must not be empty".to_string()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(Error::Configuration(format!("duplicate agent id '{}'", agent.id)));
            }
            if !agent.address.starts_with("http://") && !agent.address.starts_with("https://") {
                return Err(Error::Configuration(format!(
                    "agent '{}' address must be an http(s) URL, got '{}'",
                    agent.id, agent.address
                )));
            }
        }
        if self.supervisor.max_parallel == 0 {
            return Err(Error::Configuration("supervisor.max_parallel must be at least 1".to_string()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Configuration("retry.backoff_multiplier must be >= 1.0".to_string()));
        }
        Ok(())
    }

    /// HTTP endpoints for the configured agents
    pub fn endpoints(&self) -> Result<Vec<AgentEndpoint>> {
        self.agents
            .iter()
            .map(|agent| {
                let timeout = Duration::from_secs(
                    agent
                        .connect_timeout_secs
                        .unwrap_or(self.init.connect_timeout_secs),
                );
                AgentEndpoint::http(agent.id.clone(), agent.address.clone(), timeout)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: SwitchboardConfig = toml::from_str("").unwrap();
        assert_eq!(config.supervisor.overall_timeout_secs, 120);
        assert_eq!(config.connector.call_timeout_secs, 60);
        assert_eq!(config.retry.budget.transport, 1);
        assert_eq!(config.tasks.upstream_retries, 1);
        assert!(config.stream.dedup.suppress_blank_final);
        assert!(config.agents.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_agents_and_overrides() {
        let config: SwitchboardConfig = toml::from_str(
            r#"
            [retry]
            initial_delay_ms = 50
            budget = { semantic = 2 }

            [stream.dedup]
            suppress_repeated_final = false

            [[agents]]
            id = "argocd"
            address = "http://argocd-agent:8080"

            [[agents]]
            id = "jira"
            address = "http://jira-agent:8080"
            connect_timeout_secs = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.budget.semantic, 2);
        assert_eq!(config.retry.budget.transport, 1);
        assert!(!config.stream.dedup.suppress_repeated_final);
        assert!(config.stream.dedup.suppress_blank_final);

        let retry = config.retry.to_retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(50));

        let endpoints = config.endpoints().unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].connect_timeout, Duration::from_secs(10));
        assert_eq!(endpoints[1].connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let agent = AgentConfig {
            id: "jira".to_string(),
            address: "http://jira:8080".to_string(),
            connect_timeout_secs: None,
        };
        let config = SwitchboardConfig {
            agents: vec![agent.clone(), agent],
            ..SwitchboardConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_non_http_address() {
        let config = SwitchboardConfig {
            agents: vec![AgentConfig {
                id: "jira".to_string(),
                address: "jira:8080".to_string(),
                connect_timeout_secs: None,
            }],
            ..SwitchboardConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
