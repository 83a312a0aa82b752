//! Skill catalogue loading.
//!
//! A skill is a directory holding a `SKILL.md` file: YAML frontmatter between
//! `---` markers, followed by the Markdown instructions handed to the model.
use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use crate::error::{ResearchError, Result};

pub const SKILL_FILE_NAME: &str = "SKILL.md";
pub const RESOURCE_DIRS: [&str; 4] = ["scripts", "references", "assets", "templates"];

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SkillMeta {
    pub name: String,
    pub description: String,
    #[serde(default, rename = "allowed-tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
}

/// Files bundled with a skill, relative to its root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkillResources {
    pub scripts: Vec<PathBuf>,
    pub references: Vec<PathBuf>,
    pub assets: Vec<PathBuf>,
    pub templates: Vec<PathBuf>,
}

impl SkillResources {
    pub fn total(&self) -> usize {
        self.scripts.len() + self.references.len() + self.assets.len() + self.templates.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillDefinition {
    pub meta: SkillMeta,
    pub instructions: String,
    pub root: PathBuf,
    pub resources: SkillResources,
}

impl SkillDefinition {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn description(&self) -> &str {
        &self.meta.description
    }
}

/// Splits `SKILL.md` content into validated frontmatter and body.
pub fn parse_skill_document(content: &str) -> Result<(SkillMeta, String)> {
    let parts = content.splitn(3, "---").collect::<Vec<_>>();
    if parts.len() < 3 {
        return Err(ResearchError::Skill(
            "no YAML frontmatter found or format is incorrect".to_string(),
        ));
    }

    let meta: SkillMeta = serde_yaml::from_str(parts[1])
        .map_err(|e| ResearchError::Skill(format!("failed to parse frontmatter: {e}")))?;
    if meta.name.trim().is_empty() {
        return Err(ResearchError::Skill("frontmatter is missing 'name'".to_string()));
    }
    if meta.description.trim().is_empty() {
        return Err(ResearchError::Skill(
            "frontmatter is missing 'description'".to_string(),
        ));
    }

    Ok((meta, parts[2].trim().to_string()))
}

fn list_resource_files(root: &Path, dir: &str) -> Vec<PathBuf> {
    let scan = root.join(dir);
    if !scan.is_dir() {
        return Vec::new();
    }
    let mut files = WalkDir::new(&scan)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect::<Vec<_>>();
    files.sort();
    files
}

pub fn load_skill(skill_file: &Path) -> Result<SkillDefinition> {
    let content = std::fs::read_to_string(skill_file).map_err(|e| {
        ResearchError::Skill(format!("failed to read '{}': {e}", skill_file.display()))
    })?;
    let (meta, instructions) = parse_skill_document(&content)?;
    let root = skill_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let resources = SkillResources {
        scripts: list_resource_files(&root, RESOURCE_DIRS[0]),
        references: list_resource_files(&root, RESOURCE_DIRS[1]),
        assets: list_resource_files(&root, RESOURCE_DIRS[2]),
        templates: list_resource_files(&root, RESOURCE_DIRS[3]),
    };

    Ok(SkillDefinition {
        meta,
        instructions,
        root,
        resources,
    })
}

/// Loads every `SKILL.md` below `root`. Malformed skills are skipped with a
/// warning; a missing directory yields an empty catalogue.
pub fn load_skills(root: &Path) -> Vec<SkillDefinition> {
    if !root.is_dir() {
        tracing::debug!(path = %root.display(), "skills directory not found");
        return Vec::new();
    }

    let mut files = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == SKILL_FILE_NAME)
        .map(|entry| entry.into_path())
        .collect::<Vec<_>>();
    files.sort();

    let mut skills: Vec<SkillDefinition> = Vec::new();
    for file in files {
        match load_skill(&file) {
            Ok(skill) => {
                if skills.iter().any(|known| known.name() == skill.name()) {
                    tracing::warn!(
                        skill = skill.name(),
                        path = %file.display(),
                        "duplicate skill name; keeping the first definition"
                    );
                    continue;
                }
                tracing::debug!(skill = skill.name(), path = %file.display(), "loaded skill");
                skills.push(skill);
            }
            Err(err) => {
                tracing::warn!(path = %file.display(), error = %err, "skipping malformed skill");
            }
        }
    }

    skills.sort_by(|a, b| a.name().cmp(b.name()));
    skills
}

pub fn run_skills_list(skills_dir: &str) {
    let skills = load_skills(Path::new(skills_dir));
    if skills.is_empty() {
        println!("No skills found under '{skills_dir}'.");
        return;
    }

    println!("Skills under '{skills_dir}':");
    for skill in skills {
        let version = skill.meta.version.as_deref().unwrap_or("-");
        println!(
            "- {} (v{}, {} resource file(s)): {}",
            skill.name(),
            version,
            skill.resources.total(),
            skill.description()
        );
    }
}
