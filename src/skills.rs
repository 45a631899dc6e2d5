//! Skill resolution and adapter materialization.
//!
//! Skills bound to an agent or flowchart node resolve in `(position, name,
//! id)` order to their highest-numbered version, each file carrying a
//! SHA-256 checksum and byte size. Resolved sets materialize as read-only
//! trees under the run workspace and, for native adapters, under the
//! provider's expected home (`.codex/skills`, `.claude/skills`,
//! `.gemini/skills`). Providers without a native adapter receive truncated
//! `SKILL.md` fallback entries attached to the prompt instead.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::model::{Skill, SkillBinding, SkillVersion};
use crate::types::{SkillId, SkillVersionId};
use crate::utils::fsutil::{self, FsError};

/// Per-skill ceiling for fallback `SKILL.md` excerpts, in bytes.
pub const SKILL_FALLBACK_MAX_PER_SKILL_BYTES: usize = 12_000;
/// Total ceiling across all fallback excerpts, in bytes.
pub const SKILL_FALLBACK_MAX_TOTAL_BYTES: usize = 32_000;

/// Workspace-relative root of the materialized skill tree.
pub const WORKSPACE_SKILLS_ROOT: &str = ".llmctl/skills";

/// Errors from resolution or materialization.
#[derive(Debug, Error, Diagnostic)]
pub enum SkillError {
    #[error("skill '{name}' has no versions and cannot be resolved for runtime")]
    #[diagnostic(code(llmctl_engine::skills::no_versions))]
    NoVersions { name: String },

    #[error("skill version {version_id} is missing SKILL.md and cannot be resolved")]
    #[diagnostic(
        code(llmctl_engine::skills::missing_skill_md),
        help("Every skill version must carry a SKILL.md at its root.")
    )]
    MissingSkillMd { version_id: SkillVersionId },

    #[error("skill file path is not path-safe: {path}")]
    #[diagnostic(
        code(llmctl_engine::skills::unsafe_path),
        help("Paths must be relative, use only [a-zA-Z0-9_./-], and never contain '.' or '..' segments.")
    )]
    UnsafePath { path: String },

    #[error("unsupported native skill adapter '{adapter}'")]
    #[diagnostic(code(llmctl_engine::skills::unsupported_adapter))]
    UnsupportedAdapter { adapter: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Fs(#[from] FsError),
}

fn sha256_text(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Validate and normalize a skill-relative path.
///
/// Backslashes normalize to `/`; absolute paths, empty/`.`/`..` segments,
/// and characters outside `[a-zA-Z0-9_./-]` are rejected.
pub fn safe_skill_relative_path(path: &str) -> Result<String, SkillError> {
    let normalized = path.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(SkillError::UnsafePath {
            path: path.to_string(),
        });
    }
    let segments: Vec<&str> = normalized.split('/').collect();
    if segments.is_empty() || segments.iter().all(|segment| segment.is_empty()) {
        return Err(SkillError::UnsafePath {
            path: path.to_string(),
        });
    }
    for segment in &segments {
        if segment.is_empty() || *segment == "." || *segment == ".." {
            return Err(SkillError::UnsafePath {
                path: path.to_string(),
            });
        }
    }
    let charset_ok = normalized
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '/' | '-'));
    if !charset_ok {
        return Err(SkillError::UnsafePath {
            path: path.to_string(),
        });
    }
    Ok(segments.join("/"))
}

// ============================================================================
// Resolved shapes
// ============================================================================

/// One resolved skill file with its integrity facts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSkillFile {
    pub path: String,
    pub content: String,
    pub checksum: String,
    pub size_bytes: u64,
}

/// One resolved skill pinned to its effective version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolvedSkill {
    pub skill_id: SkillId,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub version_id: SkillVersionId,
    pub version: String,
    pub manifest_hash: String,
    pub files: Vec<ResolvedSkillFile>,
}

/// Ordered, content-addressed set of resolved skills.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolvedSkillSet {
    pub skills: Vec<ResolvedSkill>,
    pub manifest_hash: String,
}

impl ResolvedSkillSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

/// Adapter decision plus materialization outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkillAdapterResult {
    /// `native` or `fallback`.
    pub mode: String,
    /// `codex`, `claude_code`, `gemini_cli`, or `prompt_fallback`.
    pub adapter: String,
    pub materialized_paths: Vec<String>,
    pub fallback_entries: Vec<SkillFallbackEntry>,
}

/// Prompt-attached excerpt for providers without a native adapter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillFallbackEntry {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub description: String,
    pub content: String,
}

// ============================================================================
// Resolution
// ============================================================================

fn latest_skill_version(skill: &Skill) -> Result<&SkillVersion, SkillError> {
    skill
        .versions
        .iter()
        .max_by_key(|version| version.id)
        .ok_or_else(|| SkillError::NoVersions {
            name: skill.name.clone(),
        })
}

fn resolve_skill_files(version: &SkillVersion) -> Result<Vec<ResolvedSkillFile>, SkillError> {
    let mut sorted = version.files.clone();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut files = Vec::with_capacity(sorted.len());
    let mut has_skill_md = false;
    for entry in sorted {
        let safe_path = safe_skill_relative_path(&entry.path)?;
        let checksum = {
            let stored = entry.checksum.trim();
            if stored.is_empty() {
                sha256_text(&entry.content)
            } else {
                stored.to_string()
            }
        };
        let size_bytes = if entry.size_bytes > 0 {
            entry.size_bytes
        } else {
            entry.content.len() as u64
        };
        if safe_path == "SKILL.md" {
            has_skill_md = true;
        }
        files.push(ResolvedSkillFile {
            path: safe_path,
            content: entry.content,
            checksum,
            size_bytes,
        });
    }
    if !has_skill_md {
        return Err(SkillError::MissingSkillMd {
            version_id: version.id,
        });
    }
    Ok(files)
}

fn file_manifest_entries(files: &[ResolvedSkillFile]) -> Vec<serde_json::Value> {
    files
        .iter()
        .map(|entry| {
            json!({
                "path": entry.path.clone(),
                "checksum": entry.checksum.clone(),
                "size_bytes": entry.size_bytes,
            })
        })
        .collect()
}

fn effective_manifest_hash(version: &SkillVersion, files: &[ResolvedSkillFile]) -> String {
    let stored = version.manifest_hash.trim();
    if !stored.is_empty() {
        return stored.to_string();
    }
    let payload = json!({
        "version_id": version.id,
        "version": version.version.clone(),
        "files": file_manifest_entries(files),
    });
    sha256_text(&payload.to_string())
}

fn resolved_set_manifest_hash(resolved: &[ResolvedSkill]) -> String {
    let payload = json!({
        "skills": resolved
            .iter()
            .map(|skill| {
                json!({
                    "skill_id": skill.skill_id,
                    "name": skill.name.clone(),
                    "version_id": skill.version_id,
                    "version": skill.version.clone(),
                    "manifest_hash": skill.manifest_hash.clone(),
                    "files": file_manifest_entries(&skill.files),
                })
            })
            .collect::<Vec<_>>(),
    });
    sha256_text(&payload.to_string())
}

/// Resolve an ordered skill set for an agent or flowchart node.
///
/// Ordering key is `(position, lowercased name, id)`; unbound positions sort
/// last. Each skill pins to its highest-numbered version.
pub fn resolve_skill_set(
    skills: &[Skill],
    bindings: &[SkillBinding],
) -> Result<ResolvedSkillSet, SkillError> {
    let position_of = |skill_id: SkillId| -> i64 {
        bindings
            .iter()
            .find(|binding| binding.skill_id == skill_id)
            .and_then(|binding| binding.position)
            .unwrap_or(i64::from(i32::MAX))
    };

    let mut ordered: Vec<&Skill> = skills.iter().collect();
    ordered.sort_by(|a, b| {
        (position_of(a.id), a.name.to_lowercase(), a.id)
            .cmp(&(position_of(b.id), b.name.to_lowercase(), b.id))
    });

    let mut resolved = Vec::with_capacity(ordered.len());
    for skill in ordered {
        let version = latest_skill_version(skill)?;
        let files = resolve_skill_files(version)?;
        let manifest_hash = effective_manifest_hash(version, &files);
        resolved.push(ResolvedSkill {
            skill_id: skill.id,
            name: skill.name.clone(),
            display_name: skill.display_name.clone(),
            description: skill.description.clone(),
            version_id: version.id,
            version: version.version.clone(),
            manifest_hash,
            files,
        });
    }

    let manifest_hash = resolved_set_manifest_hash(&resolved);
    Ok(ResolvedSkillSet {
        skills: resolved,
        manifest_hash,
    })
}

// ============================================================================
// Adapter selection & materialization
// ============================================================================

/// Pick the skill adapter for a provider.
///
/// `codex → native(codex)`, `claude → native(claude_code)`,
/// `gemini → native(gemini_cli)`; anything else falls back to
/// `fallback(prompt_fallback)`.
#[must_use]
pub fn select_skill_adapter(provider: &str) -> (&'static str, &'static str) {
    match provider.trim().to_ascii_lowercase().as_str() {
        "codex" => ("native", "codex"),
        "claude" => ("native", "claude_code"),
        "gemini" => ("native", "gemini_cli"),
        _ => ("fallback", "prompt_fallback"),
    }
}

fn native_materialization_root(
    adapter: &str,
    runtime_home: &Path,
    codex_home: Option<&Path>,
) -> Result<PathBuf, SkillError> {
    match adapter {
        "codex" => Ok(codex_home
            .map(Path::to_path_buf)
            .unwrap_or_else(|| runtime_home.join(".codex"))
            .join("skills")),
        "claude_code" => Ok(runtime_home.join(".claude").join("skills")),
        "gemini_cli" => Ok(runtime_home.join(".gemini").join("skills")),
        other => Err(SkillError::UnsupportedAdapter {
            adapter: other.to_string(),
        }),
    }
}

fn materialize_skill_tree(
    target_root: &Path,
    resolved: &ResolvedSkillSet,
) -> Result<Vec<String>, SkillError> {
    fsutil::replace_tree(target_root)?;
    let mut materialized_paths = Vec::with_capacity(resolved.skills.len());
    for skill in &resolved.skills {
        let skill_dir = target_root.join(&skill.name);
        for entry in &skill.files {
            let destination = skill_dir.join(&entry.path);
            fsutil::write_read_only_file(&destination, entry.content.as_bytes())?;
        }
        materialized_paths.push(skill_dir.to_string_lossy().into_owned());
    }
    Ok(materialized_paths)
}

/// Materialize a resolved skill set for the given provider.
///
/// The workspace tree is always written. Native adapters additionally write
/// the adapter home tree; if that write fails, `allow_adapter_fallback`
/// decides between downgrading to prompt fallback entries and failing the
/// run.
pub fn materialize_skill_set(
    resolved: &ResolvedSkillSet,
    provider: &str,
    workspace: &Path,
    runtime_home: &Path,
    codex_home: Option<&Path>,
    allow_adapter_fallback: bool,
) -> Result<SkillAdapterResult, SkillError> {
    let (mode, adapter) = select_skill_adapter(provider);
    if resolved.skills.is_empty() {
        return Ok(SkillAdapterResult {
            mode: mode.to_string(),
            adapter: adapter.to_string(),
            materialized_paths: Vec::new(),
            fallback_entries: Vec::new(),
        });
    }

    let workspace_root = workspace.join(WORKSPACE_SKILLS_ROOT);
    let mut materialized_paths = materialize_skill_tree(&workspace_root, resolved)?;

    if mode == "fallback" {
        return Ok(SkillAdapterResult {
            mode: mode.to_string(),
            adapter: adapter.to_string(),
            materialized_paths,
            fallback_entries: build_skill_fallback_entries(resolved),
        });
    }

    let target_root = native_materialization_root(adapter, runtime_home, codex_home)?;
    match materialize_skill_tree(&target_root, resolved) {
        Ok(native_paths) => {
            materialized_paths.extend(native_paths);
            Ok(SkillAdapterResult {
                mode: mode.to_string(),
                adapter: adapter.to_string(),
                materialized_paths,
                fallback_entries: Vec::new(),
            })
        }
        Err(err) if allow_adapter_fallback => {
            warn!(
                target: "llmctl_engine::skills",
                adapter,
                error = %err,
                "native skill materialization failed; downgrading to prompt fallback"
            );
            Ok(SkillAdapterResult {
                mode: "fallback".to_string(),
                adapter: "prompt_fallback".to_string(),
                materialized_paths,
                fallback_entries: build_skill_fallback_entries(resolved),
            })
        }
        Err(err) => Err(err),
    }
}

fn truncate_to_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Build prompt fallback entries from each skill's `SKILL.md`.
///
/// Excerpts are capped at 12,000 bytes per skill and 32,000 bytes across the
/// whole set; skills past the total budget are dropped.
#[must_use]
pub fn build_skill_fallback_entries(resolved: &ResolvedSkillSet) -> Vec<SkillFallbackEntry> {
    let mut entries = Vec::new();
    let mut remaining_total = SKILL_FALLBACK_MAX_TOTAL_BYTES;

    for skill in &resolved.skills {
        let Some(skill_md) = skill
            .files
            .iter()
            .find(|entry| entry.path == "SKILL.md")
            .map(|entry| entry.content.as_str())
        else {
            continue;
        };
        let mut snippet = skill_md.trim();
        snippet = truncate_to_bytes(snippet, SKILL_FALLBACK_MAX_PER_SKILL_BYTES);
        snippet = truncate_to_bytes(snippet, remaining_total);
        let snippet = snippet.trim();
        if snippet.is_empty() {
            continue;
        }

        remaining_total -= snippet.len();
        entries.push(SkillFallbackEntry {
            name: skill.name.clone(),
            display_name: skill.display_name.clone(),
            version: skill.version.clone(),
            description: skill.description.clone(),
            content: snippet.to_string(),
        });
        if remaining_total == 0 {
            break;
        }
    }

    entries
}

/// Skill ids in resolved order, for node-run persistence.
#[must_use]
pub fn skill_ids_payload(resolved: &ResolvedSkillSet) -> Vec<SkillId> {
    resolved.skills.iter().map(|skill| skill.skill_id).collect()
}

/// Skill version summaries in resolved order, for node-run persistence.
#[must_use]
pub fn skill_versions_payload(resolved: &ResolvedSkillSet) -> Vec<serde_json::Value> {
    resolved
        .skills
        .iter()
        .map(|skill| {
            json!({
                "skill_id": skill.skill_id,
                "name": skill.name.clone(),
                "version_id": skill.version_id,
                "version": skill.version.clone(),
            })
        })
        .collect()
}
