//! Concurrent initialization manager
//!
//! Every configured agent is brought up at the same time, each bounded by its
//! own connect timeout. A slow or broken agent is reported and left out; it
//! never delays or blocks the others.

use crate::connector::{AgentTransport, ConnectorConfig, HttpTransport, RemoteAgentConnector};
use crate::error::Result;
use crate::stream::DedupPolicy;
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Outcome of bringing up one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Readiness {
    /// Descriptor fetched, agent usable
    Ready,
    /// Agent answered with an error or an inconsistent descriptor
    Unavailable(String),
    /// No answer within the connect timeout
    TimedOut,
}

impl Readiness {
    /// Whether the agent can be routed to
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// One line of the readiness report.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessEntry {
    /// Configured agent id
    pub agent_id: String,
    /// Configured address
    pub address: String,
    /// Outcome
    pub readiness: Readiness,
    /// Time spent before the outcome was known
    pub elapsed_ms: u64,
    /// Connector, present only when ready
    #[serde(skip)]
    pub connector: Option<Arc<RemoteAgentConnector>>,
}

/// Per-agent outcome of [`initialize`], in configuration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadinessReport {
    entries: Vec<ReadinessEntry>,
}

impl ReadinessReport {
    /// Build a report from entries
    pub fn new(entries: Vec<ReadinessEntry>) -> Self {
        Self { entries }
    }

    /// All entries
    pub fn entries(&self) -> &[ReadinessEntry] {
        &self.entries
    }

    /// Connectors of ready agents, in configuration order
    pub fn ready(&self) -> impl Iterator<Item = &Arc<RemoteAgentConnector>> {
        self.entries.iter().filter_map(|e| e.connector.as_ref())
    }

    /// Number of ready agents
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready().count()
    }

    /// Entry for `agent_id`
    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<&ReadinessEntry> {
        self.entries.iter().find(|e| e.agent_id == agent_id)
    }
}

impl fmt::Display for ReadinessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}/{} agents ready", self.ready_count(), self.entries.len())?;
        for entry in &self.entries {
            match &entry.readiness {
                Readiness::Ready => {
                    let skills = entry
                        .connector
                        .as_ref()
                        .map(|c| {
                            c.descriptor()
                                .skills
                                .iter()
                                .map(|s| s.tag.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        })
                        .unwrap_or_default();
                    writeln!(
                        f,
                        "  ✓ {} ({}) ready in {}ms [{}]",
                        entry.agent_id, entry.address, entry.elapsed_ms, skills
                    )?;
                }
                Readiness::Unavailable(reason) => {
                    writeln!(f, "  ✗ {} ({}) unavailable: {}", entry.agent_id, entry.address, reason)?;
                }
                Readiness::TimedOut => {
                    writeln!(
                        f,
                        "  ⏳ {} ({}) timed out after {}ms",
                        entry.agent_id, entry.address, entry.elapsed_ms
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// A configured agent, not yet contacted.
#[derive(Clone)]
pub struct AgentEndpoint {
    /// Expected agent id
    pub id: String,
    /// Address, for reporting
    pub address: String,
    /// Bound on descriptor discovery
    pub connect_timeout: Duration,
    /// How to reach it
    pub transport: Arc<dyn AgentTransport>,
}

impl fmt::Debug for AgentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentEndpoint")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl AgentEndpoint {
    /// Endpoint over an arbitrary transport
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        connect_timeout: Duration,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            connect_timeout,
            transport,
        }
    }

    /// Endpoint reached over HTTP at `address`
    pub fn http(id: impl Into<String>, address: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let address = address.into();
        let transport = HttpTransport::new(address.clone(), connect_timeout)?;
        Ok(Self::new(id, address, connect_timeout, Arc::new(transport)))
    }
}

/// Bring up all endpoints concurrently.
pub async fn initialize(
    endpoints: Vec<AgentEndpoint>,
    config: &ConnectorConfig,
    dedup: DedupPolicy,
) -> ReadinessReport {
    info!(agents = endpoints.len(), "Initializing agents");

    let entries = join_all(
        endpoints
            .into_iter()
            .map(|endpoint| bring_up(endpoint, config.clone(), dedup)),
    )
    .await;

    let report = ReadinessReport::new(entries);
    info!(
        ready = report.ready_count(),
        total = report.entries().len(),
        "Agent initialization finished"
    );
    report
}

async fn bring_up(endpoint: AgentEndpoint, config: ConnectorConfig, dedup: DedupPolicy) -> ReadinessEntry {
    let started = Instant::now();
    let outcome = tokio::time::timeout(endpoint.connect_timeout, endpoint.transport.fetch_descriptor()).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let (readiness, connector) = match outcome {
        Ok(Ok(descriptor)) if descriptor.id == endpoint.id => {
            info!(agent_id = %endpoint.id, skills = descriptor.skills.len(), elapsed_ms, "Agent ready");
            let connector = RemoteAgentConnector::new(descriptor, endpoint.transport, config, dedup);
            (Readiness::Ready, Some(Arc::new(connector)))
        }
        Ok(Ok(descriptor)) => {
            let reason = format!(
                "descriptor reports id '{}', expected '{}'",
                descriptor.id, endpoint.id
            );
            warn!(agent_id = %endpoint.id, reason = %reason, "Agent unavailable");
            (Readiness::Unavailable(reason), None)
        }
        Ok(Err(e)) => {
            warn!(agent_id = %endpoint.id, error = %e, "Agent unavailable");
            (Readiness::Unavailable(e.to_string()), None)
        }
        Err(_) => {
            warn!(
                agent_id = %endpoint.id,
                timeout_ms = endpoint.connect_timeout.as_millis() as u64,
                "Agent timed out during initialization"
            );
            (Readiness::TimedOut, None)
        }
    };

    ReadinessEntry {
        agent_id: endpoint.id,
        address: endpoint.address,
        readiness,
        elapsed_ms,
        connector,
    }
}
