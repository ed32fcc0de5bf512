use crate::connector::RemoteAgentConnector;
use crate::init::ReadinessReport;
use crate::protocol::Skill;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Tag words too generic to route on. Declared keywords are never filtered.
const GENERIC_TAG_WORDS: &[&str] = &[
    "check", "create", "delete", "get", "info", "list", "query", "read", "search", "show",
    "status", "update", "write",
];

/// A skill with its keyword patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledSkill {
    /// Declared skill
    pub skill: Skill,
    patterns: Vec<Regex>,
}

impl CompiledSkill {
    fn compile(skill: Skill) -> Self {
        let mut words: Vec<String> = skill
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .chain(
                skill
                    .tag
                    .split(['.', '_', '-'])
                    .map(|w| w.trim().to_lowercase())
                    .filter(|w| !GENERIC_TAG_WORDS.contains(&w.as_str())),
            )
            .filter(|w| !w.is_empty())
            .collect();
        words.sort();
        words.dedup();

        let patterns = words
            .iter()
            .filter_map(|word| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(word));
                match Regex::new(&pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(tag = %skill.tag, keyword = %word, error = %e, "Skipping keyword");
                        None
                    }
                }
            })
            .collect();

        Self { skill, patterns }
    }

    /// Number of distinct keywords found in `text` as whole words
    #[must_use]
    pub fn score(&self, text: &str) -> usize {
        self.patterns.iter().filter(|re| re.is_match(text)).count()
    }
}

/// One routable agent.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    /// Connector to the agent
    pub connector: Arc<RemoteAgentConnector>,
    /// Its skills, in declaration order
    pub skills: Vec<CompiledSkill>,
}

impl AgentEntry {
    /// Agent id
    #[must_use]
    pub fn id(&self) -> &str {
        self.connector.agent_id()
    }

    /// Display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.connector.descriptor().name
    }

    /// Best-scoring skill for `text`; the earliest one wins ties.
    #[must_use]
    pub fn best_skill(&self, text: &str) -> Option<(&CompiledSkill, usize)> {
        self.skills
            .iter()
            .map(|s| (s, s.score(text)))
            .fold(None, |best, (skill, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((skill, score)),
            })
    }
}

/// Explicit `{capability tag → agents}` table.
///
/// Built once from a readiness report; agents that were not ready are absent.
/// Never mutated, only replaced.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    agents: Vec<AgentEntry>,
    by_tag: BTreeMap<String, Vec<usize>>,
}

impl CapabilityTable {
    /// Table over the given connectors, in order
    pub fn new(connectors: impl IntoIterator<Item = Arc<RemoteAgentConnector>>) -> Self {
        let mut agents: Vec<AgentEntry> = Vec::new();
        for connector in connectors {
            if agents.iter().any(|a| a.id() == connector.agent_id()) {
                warn!(agent_id = %connector.agent_id(), "Duplicate agent id ignored");
                continue;
            }
            let skills = connector
                .descriptor()
                .skills
                .iter()
                .cloned()
                .map(CompiledSkill::compile)
                .collect();
            agents.push(AgentEntry { connector, skills });
        }

        let mut by_tag: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, agent) in agents.iter().enumerate() {
            for skill in &agent.skills {
                let providers = by_tag.entry(skill.skill.tag.clone()).or_default();
                if !providers.contains(&index) {
                    providers.push(index);
                }
            }
        }

        Self { agents, by_tag }
    }

    /// Table over the ready agents of `report`
    pub fn from_report(report: &ReadinessReport) -> Self {
        Self::new(report.ready().cloned())
    }

    /// Agents in table order
    pub fn agents(&self) -> &[AgentEntry] {
        &self.agents
    }

    /// Agent by id, case-insensitive
    #[must_use]
    pub fn agent(&self, id: &str) -> Option<&AgentEntry> {
        self.agents.iter().find(|a| a.id().eq_ignore_ascii_case(id))
    }

    /// Known capability tags, sorted
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.by_tag.keys().map(String::as_str)
    }

    /// Agents offering `tag`
    pub fn providers(&self, tag: &str) -> impl Iterator<Item = &AgentEntry> {
        self.by_tag
            .get(tag)
            .into_iter()
            .flatten()
            .map(|&i| &self.agents[i])
    }

    /// Number of agents
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is routable
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
