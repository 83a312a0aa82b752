//! Catalogue of invocable names: loaded skills and sub-agent prototypes.
//!
//! Built once per session; lookups never hand out the stored prototypes
//! themselves, only fresh instances.
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::agents::Agent;
use crate::skills::SkillDefinition;

/// What a task name resolved to.
pub enum Capability<'a> {
    Skill(&'a SkillDefinition),
    SubAgent(Box<dyn Agent>),
}

#[derive(Default)]
pub struct CapabilityRegistry {
    skills: BTreeMap<String, SkillDefinition>,
    agents: BTreeMap<String, Box<dyn Agent>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first skill registered under a name wins.
    pub fn register_skill(&mut self, skill: SkillDefinition) {
        match self.skills.entry(skill.name().to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(skill);
            }
            Entry::Occupied(existing) => {
                tracing::warn!(
                    skill = %existing.key(),
                    ignored = %skill.root.display(),
                    "skill registered twice; keeping the first"
                );
            }
        }
    }

    pub fn register_agent(&mut self, agent: Box<dyn Agent>) {
        match self.agents.entry(agent.name().to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(agent);
            }
            Entry::Occupied(existing) => {
                tracing::warn!(agent = %existing.key(), "sub-agent registered twice; keeping the first");
            }
        }
    }

    /// Skill lookup first, then a fresh clone of the sub-agent prototype.
    pub fn resolve(&self, name: &str) -> Option<Capability<'_>> {
        if let Some(skill) = self.skills.get(name) {
            return Some(Capability::Skill(skill));
        }
        self.agents
            .get(name)
            .map(|prototype| Capability::SubAgent(prototype.fresh()))
    }

    pub fn skills(&self) -> impl Iterator<Item = &SkillDefinition> {
        self.skills.values()
    }

    pub fn agents(&self) -> impl Iterator<Item = &(dyn Agent + 'static)> {
        self.agents.values().map(|agent| &**agent)
    }

    pub fn skill_count(&self) -> usize {
        self.skills.len()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// `- name: description` lines for every skill.
    pub fn skills_catalogue(&self) -> String {
        self.skills()
            .map(|skill| format!("- {}: {}\n", skill.name(), skill.description()))
            .collect()
    }

    /// `- name: description` lines for every sub-agent.
    pub fn agents_catalogue(&self) -> String {
        self.agents()
            .map(|agent| format!("- {}: {}\n", agent.name(), agent.description()))
            .collect()
    }
}
