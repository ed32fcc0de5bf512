use super::registry::CapabilityTable;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// `@agent` mention at the start of the text or after whitespace
pub(crate) static MENTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)@([A-Za-z][\w-]*)").expect("MENTION_REGEX is a compile-time constant")
});

/// One agent selected for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Agent id
    pub agent_id: String,
    /// Capability tag the agent was selected for
    pub tag: String,
    /// Text to send to the agent
    pub instruction: String,
    /// Keyword hits; zero for explicit mentions
    pub score: usize,
    /// Selected by `@mention`
    pub explicit: bool,
}

/// Outcome of matching a request against the capability table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Independent agents, in table order (or mention order)
    Dispatch(Vec<Candidate>),
    /// Several agents offer the same exclusive capability
    Ambiguous {
        /// Contested tag
        tag: String,
        /// The competing candidates
        candidates: Vec<Candidate>,
    },
    /// The request names agents that are not routable
    Unavailable(Vec<String>),
    /// Nothing matched
    NoMatch,
}

/// Select agents for `text`.
///
/// Explicit `@agent` mentions take precedence: each mentioned agent gets the
/// text up to the next mention. Otherwise every agent whose best skill has a
/// whole-word keyword hit is a candidate.
pub fn match_request(table: &CapabilityTable, text: &str) -> MatchOutcome {
    let mentions: Vec<_> = MENTION_REGEX.captures_iter(text).collect();
    if !mentions.is_empty() {
        return match_mentions(table, text, &mentions);
    }

    let candidates: Vec<Candidate> = table
        .agents()
        .iter()
        .filter_map(|agent| {
            let (skill, score) = agent.best_skill(text)?;
            (score > 0).then(|| Candidate {
                agent_id: agent.id().to_string(),
                tag: skill.skill.tag.clone(),
                instruction: text.trim().to_string(),
                score,
                explicit: false,
            })
        })
        .collect();

    if candidates.is_empty() {
        return MatchOutcome::NoMatch;
    }

    let mut by_tag: BTreeMap<&str, Vec<&Candidate>> = BTreeMap::new();
    for candidate in &candidates {
        by_tag.entry(candidate.tag.as_str()).or_default().push(candidate);
    }
    for (tag, group) in by_tag {
        if group.len() < 2 {
            continue;
        }
        let exclusive = group.iter().any(|c| {
            table
                .agent(&c.agent_id)
                .and_then(|a| a.skills.iter().find(|s| s.skill.tag == tag))
                .is_some_and(|s| !s.skill.aggregatable)
        });
        if exclusive {
            return MatchOutcome::Ambiguous {
                tag: tag.to_string(),
                candidates: group.into_iter().cloned().collect(),
            };
        }
    }

    MatchOutcome::Dispatch(candidates)
}

fn match_mentions(
    table: &CapabilityTable,
    text: &str,
    mentions: &[regex::Captures<'_>],
) -> MatchOutcome {
    let stripped = MENTION_REGEX.replace_all(text, " ");
    let stripped = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut missing = Vec::new();
    let mut candidates: Vec<Candidate> = Vec::new();

    for (i, mention) in mentions.iter().enumerate() {
        let Some(name) = mention.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let Some(agent) = table.agent(name) else {
            missing.push(name.to_string());
            continue;
        };
        if candidates.iter().any(|c| c.agent_id == agent.id()) {
            continue;
        }

        let start = mention.get(0).map_or(0, |m| m.end());
        let end = mentions
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        let segment = text[start..end].trim();
        let instruction = if segment.is_empty() {
            stripped.clone()
        } else {
            segment.to_string()
        };

        let tag = agent
            .best_skill(&instruction)
            .map(|(skill, _)| skill.skill.tag.clone())
            .unwrap_or_else(|| "general".to_string());

        candidates.push(Candidate {
            agent_id: agent.id().to_string(),
            tag,
            instruction,
            score: 0,
            explicit: true,
        });
    }

    if !missing.is_empty() {
        return MatchOutcome::Unavailable(missing);
    }
    MatchOutcome::Dispatch(candidates)
}
