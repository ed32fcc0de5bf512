use serde::{Deserialize, Serialize};

/// A capability a sub-agent declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    /// Capability tag (e.g. "deployment.sync", "tickets.query")
    pub tag: String,
    /// Human-readable description
    pub description: String,
    /// Words or phrases that select this skill
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Example utterances
    #[serde(default)]
    pub examples: Vec<String>,
    /// Results from several agents offering this tag can be merged.
    /// When false, two agents offering the tag are competing interpretations.
    #[serde(default)]
    pub aggregatable: bool,
}

impl Skill {
    /// Create a skill with no keywords
    pub fn new(tag: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            description: description.into(),
            keywords: Vec::new(),
            examples: Vec::new(),
            aggregatable: false,
        }
    }

    /// Add selection keywords
    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    /// Add an example utterance
    #[must_use]
    pub fn with_example(mut self, example: impl Into<String>) -> Self {
        self.examples.push(example.into());
        self
    }

    /// Mark results as mergeable across agents
    #[must_use]
    pub fn aggregatable(mut self) -> Self {
        self.aggregatable = true;
        self
    }
}

/// Static metadata for a callable sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Stable identifier (e.g. "argocd")
    pub id: String,
    /// Display name
    pub name: String,
    /// What the agent does
    #[serde(default)]
    pub description: String,
    /// Network address (base URL)
    pub address: String,
    /// Declared skills
    #[serde(default)]
    pub skills: Vec<Skill>,
}

impl AgentDescriptor {
    /// Create a descriptor with no skills
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            address: address.into(),
            skills: Vec::new(),
        }
    }

    /// Set description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a skill
    #[must_use]
    pub fn with_skill(mut self, skill: Skill) -> Self {
        self.skills.push(skill);
        self
    }

    /// Skill by tag
    #[must_use]
    pub fn skill(&self, tag: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.tag == tag)
    }
}
