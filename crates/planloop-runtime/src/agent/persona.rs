//! Named system prompts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::tool::ToolRegistry;

pub const DEFAULT_PERSONA: &str = "default";
pub const SUBAGENT_PERSONA: &str = "subagent";
pub const DEEP_RESEARCH_PERSONA: &str = "deep_research";

const DEFAULT_PROMPT: &str = "\
You are an assistant that can delegate work to subagents running in parallel.

Answer directly when a question is simple. For larger requests, split the work \
into independent subtasks and hand each one to `spawn_subagent`; every subagent \
reports its result back to you. Use `web_search` for current information.

Do not delegate work that must happen in sequence or that you can finish \
yourself in one step. When subagents report back, combine their findings into \
one coherent answer.

Plan before acting. Put your reasoning inside <thought></thought> tags.";

const SUBAGENT_PROMPT: &str = "\
You are a subagent working on exactly one assigned task.

Stay on that task and finish it with what you have; do not ask questions and \
do not try to start other subagents. Your whole reply is passed back to the \
agent that started you, so make it complete and self-contained.";

const DEEP_RESEARCH_PROMPT: &str = "\
You are a research agent. Investigate the question thoroughly and answer with \
citations.

Work in rounds: identify what is still unknown, search with `web_search`, read \
the most promising pages with `browser_content`, then decide whether another \
round is needed. Do not rely on search snippets alone; confirm claims against \
several independent sources and cite a URL for each one.

Put your reasoning inside <thought></thought> tags before calling tools.";

/// Unknown persona name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown persona '{0}'")]
pub struct UnknownPersona(pub String);

/// A system prompt plus the tools it expects to have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub required_tools: Vec<String>,
}

impl Persona {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            required_tools: Vec::new(),
        }
    }

    #[must_use]
    pub fn requiring<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Required tools the registry does not provide. `spawn_subagent` is
    /// supplied by the executor and always counts as present.
    pub fn missing_tools(&self, registry: &ToolRegistry) -> Vec<&str> {
        self.required_tools
            .iter()
            .map(String::as_str)
            .filter(|name| {
                *name != super::subagent::SPAWN_SUBAGENT_TOOL && !registry.contains(name)
            })
            .collect()
    }
}

/// Lookup of personas by name.
#[derive(Debug, Clone)]
pub struct PersonaCatalog {
    personas: BTreeMap<String, Persona>,
}

impl Default for PersonaCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PersonaCatalog {
    /// `default`, `subagent` and `deep_research`.
    pub fn builtin() -> Self {
        let mut catalog = Self {
            personas: BTreeMap::new(),
        };
        catalog.insert(
            Persona::new(DEFAULT_PERSONA, DEFAULT_PROMPT).requiring(["web_search"]),
        );
        catalog.insert(Persona::new(SUBAGENT_PERSONA, SUBAGENT_PROMPT));
        catalog.insert(
            Persona::new(DEEP_RESEARCH_PERSONA, DEEP_RESEARCH_PROMPT)
                .requiring(["web_search", "browser_content"]),
        );
        catalog
    }

    /// Add or replace a persona.
    pub fn insert(&mut self, persona: Persona) {
        self.personas.insert(persona.name.clone(), persona);
    }

    pub fn get(&self, name: &str) -> Result<&Persona, UnknownPersona> {
        self.personas
            .get(name)
            .ok_or_else(|| UnknownPersona(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.personas.keys().map(String::as_str).collect()
    }
}
