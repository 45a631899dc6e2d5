//! Instruction package compiler and materializer.
//!
//! Normalizes role/agent markdown and runtime overrides into a deterministic
//! artifact set (`ROLE.md`, `AGENT.md`, `INSTRUCTIONS.md`, and, for autorun
//! with priorities, `PRIORITIES.md`), fingerprints it with a canonical-JSON
//! SHA-256 manifest hash, and writes the files read-only under the run
//! workspace. The manifest hash depends only on content, never on
//! `generated_at`, so identical inputs always produce identical packages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use miette::Diagnostic;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::utils::fsutil::{self, FsError};

pub const ROLE_FILENAME: &str = "ROLE.md";
pub const AGENT_FILENAME: &str = "AGENT.md";
pub const PRIORITIES_FILENAME: &str = "PRIORITIES.md";
pub const INSTRUCTIONS_FILENAME: &str = "INSTRUCTIONS.md";
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Default subdirectory for materialized instruction packages.
pub const DEFAULT_INSTRUCTIONS_SUBDIR: &str = ".llmctl/instructions";

/// Errors from compilation or materialization.
#[derive(Debug, Error, Diagnostic)]
pub enum InstructionError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Fs(#[from] FsError),

    #[error("materialized instruction path {path} escapes every permitted root")]
    #[diagnostic(
        code(llmctl_engine::instructions::policy),
        help(
            "Instruction files must resolve beneath the workspace, the runtime home, or the codex home."
        )
    )]
    PolicyViolation { path: PathBuf },

    #[error("manifest serialization failed: {0}")]
    #[diagnostic(code(llmctl_engine::instructions::serde))]
    Serde(#[from] serde_json::Error),
}

fn sha256_text(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize markdown: LF line endings, per-line trailing whitespace trimmed,
/// surrounding blank lines stripped, single trailing newline when non-empty.
#[must_use]
pub fn normalize_markdown(value: &str) -> String {
    let unified = value.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed_lines: Vec<&str> = unified.split('\n').map(str::trim_end).collect();
    let joined = trimmed_lines.join("\n");
    let core = joined.trim_matches('\n');
    if core.is_empty() {
        String::new()
    } else {
        format!("{core}\n")
    }
}

fn normalize_entries(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| normalize_markdown(entry).trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn render_priorities_markdown(priorities: &[String]) -> String {
    let mut lines = vec!["# Priorities".to_string(), String::new()];
    for (index, entry) in priorities.iter().enumerate() {
        lines.push(format!("## Priority {}", index + 1));
        lines.push(String::new());
        lines.push(entry.clone());
        lines.push(String::new());
    }
    normalize_markdown(&lines.join("\n"))
}

fn render_runtime_overrides_markdown(runtime_overrides: &[String]) -> String {
    let mut lines = vec!["## Runtime Overrides".to_string(), String::new()];
    for (index, entry) in runtime_overrides.iter().enumerate() {
        lines.push(format!("### Override {}", index + 1));
        lines.push(String::new());
        lines.push(entry.clone());
        lines.push(String::new());
    }
    normalize_markdown(&lines.join("\n"))
}

#[allow(clippy::too_many_arguments)]
fn render_instructions_markdown(
    run_mode: &str,
    provider: &str,
    role_markdown: &str,
    agent_markdown: &str,
    priorities_markdown: Option<&str>,
    runtime_overrides: &[String],
    provider_header: &str,
    provider_suffix: &str,
) -> String {
    let mut lines = vec![
        "# Compiled Instructions".to_string(),
        String::new(),
        format!("Run mode: `{run_mode}`"),
        format!("Provider: `{provider}`"),
        String::new(),
    ];
    if !provider_header.is_empty() {
        lines.extend([
            "## Provider Header".to_string(),
            String::new(),
            provider_header.to_string(),
            String::new(),
        ]);
    }
    lines.extend([
        "## Role Source".to_string(),
        String::new(),
        role_markdown.trim().to_string(),
        String::new(),
    ]);
    lines.extend([
        "## Agent Source".to_string(),
        String::new(),
        agent_markdown.trim().to_string(),
        String::new(),
    ]);
    if let Some(priorities) = priorities_markdown {
        lines.extend([
            "## Priorities Source".to_string(),
            String::new(),
            priorities.trim().to_string(),
            String::new(),
        ]);
    }
    if !runtime_overrides.is_empty() {
        lines.extend([
            render_runtime_overrides_markdown(runtime_overrides)
                .trim()
                .to_string(),
            String::new(),
        ]);
    }
    if !provider_suffix.is_empty() {
        lines.extend([
            "## Provider Suffix".to_string(),
            String::new(),
            provider_suffix.to_string(),
            String::new(),
        ]);
    }
    normalize_markdown(&lines.join("\n"))
}

/// Input to [`compile_instruction_package`].
#[derive(Clone, Debug, Default)]
pub struct InstructionCompileInput {
    pub run_mode: String,
    pub provider: String,
    pub role_markdown: String,
    pub agent_markdown: String,
    pub priorities: Vec<String>,
    pub runtime_overrides: Vec<String>,
    pub provider_header: String,
    pub provider_suffix: String,
    pub source_ids: BTreeMap<String, Option<i64>>,
    pub source_versions: BTreeMap<String, Option<String>>,
    /// RFC3339 timestamp recorded in the manifest; never part of the hash.
    pub generated_at: Option<String>,
}

impl InstructionCompileInput {
    #[must_use]
    pub fn new(run_mode: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            run_mode: run_mode.into(),
            provider: provider.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_role_markdown(mut self, role_markdown: impl Into<String>) -> Self {
        self.role_markdown = role_markdown.into();
        self
    }

    #[must_use]
    pub fn with_agent_markdown(mut self, agent_markdown: impl Into<String>) -> Self {
        self.agent_markdown = agent_markdown.into();
        self
    }

    #[must_use]
    pub fn with_priorities(mut self, priorities: Vec<String>) -> Self {
        self.priorities = priorities;
        self
    }

    #[must_use]
    pub fn with_runtime_overrides(mut self, runtime_overrides: Vec<String>) -> Self {
        self.runtime_overrides = runtime_overrides;
        self
    }

    #[must_use]
    pub fn with_source_id(mut self, key: impl Into<String>, id: Option<i64>) -> Self {
        self.source_ids.insert(key.into(), id);
        self
    }

    #[must_use]
    pub fn with_source_version(mut self, key: impl Into<String>, version: Option<String>) -> Self {
        self.source_versions.insert(key.into(), version);
        self
    }

    #[must_use]
    pub fn with_generated_at(mut self, generated_at: impl Into<String>) -> Self {
        self.generated_at = Some(generated_at.into());
        self
    }
}

/// Compiled artifact set plus its content-addressed manifest.
#[derive(Clone, Debug)]
pub struct CompiledInstructionPackage {
    pub run_mode: String,
    pub provider: String,
    /// Filename → normalized content, iterated in sorted order.
    pub artifacts: BTreeMap<String, String>,
    pub manifest: Value,
    pub manifest_hash: String,
}

/// Compile role/agent/priorities into a deterministic instruction package.
///
/// `PRIORITIES.md` is emitted only when `run_mode == "autorun"` and the
/// normalized priority list is non-empty. Empty role/agent markdown becomes a
/// placeholder so downstream consumers always find the files.
#[must_use]
pub fn compile_instruction_package(input: &InstructionCompileInput) -> CompiledInstructionPackage {
    let run_mode = {
        let trimmed = input.run_mode.trim();
        if trimmed.is_empty() { "task" } else { trimmed }.to_string()
    };
    let provider = {
        let trimmed = input.provider.trim();
        if trimmed.is_empty() { "unknown" } else { trimmed }.to_string()
    };

    let mut role_markdown = normalize_markdown(&input.role_markdown);
    if role_markdown.is_empty() {
        role_markdown = "# Role\n\nNo role instructions resolved.\n".to_string();
    }
    let mut agent_markdown = normalize_markdown(&input.agent_markdown);
    if agent_markdown.is_empty() {
        agent_markdown = "# Agent\n\nNo agent instructions resolved.\n".to_string();
    }

    let runtime_overrides = normalize_entries(&input.runtime_overrides);
    let priorities = normalize_entries(&input.priorities);
    let priorities_markdown = if run_mode == "autorun" && !priorities.is_empty() {
        Some(render_priorities_markdown(&priorities))
    } else {
        None
    };
    let provider_header = normalize_markdown(&input.provider_header).trim().to_string();
    let provider_suffix = normalize_markdown(&input.provider_suffix).trim().to_string();

    let instructions_markdown = render_instructions_markdown(
        &run_mode,
        &provider,
        &role_markdown,
        &agent_markdown,
        priorities_markdown.as_deref(),
        &runtime_overrides,
        &provider_header,
        &provider_suffix,
    );

    let mut artifacts: BTreeMap<String, String> = BTreeMap::new();
    artifacts.insert(ROLE_FILENAME.to_string(), role_markdown);
    artifacts.insert(AGENT_FILENAME.to_string(), agent_markdown);
    artifacts.insert(INSTRUCTIONS_FILENAME.to_string(), instructions_markdown);
    if let Some(priorities_md) = priorities_markdown.clone() {
        artifacts.insert(PRIORITIES_FILENAME.to_string(), priorities_md);
    }

    let mut artifact_manifest: BTreeMap<String, Value> = BTreeMap::new();
    let mut total_size_bytes: u64 = 0;
    for (file_name, content) in &artifacts {
        let size_bytes = content.len() as u64;
        total_size_bytes += size_bytes;
        artifact_manifest.insert(
            file_name.clone(),
            json!({
                "path": file_name,
                "sha256": sha256_text(content),
                "size_bytes": size_bytes,
            }),
        );
    }

    // serde_json maps are BTree-backed, so serialization is already canonical
    // (sorted keys, compact separators).
    let fingerprint = json!({
        "package_version": 1,
        "run_mode": &run_mode,
        "provider": &provider,
        "source_ids": &input.source_ids,
        "source_versions": &input.source_versions,
        "artifact_manifest": &artifact_manifest,
    });
    let manifest_hash = sha256_text(&fingerprint.to_string());

    let generated_at = input
        .generated_at
        .clone()
        .unwrap_or_else(|| Utc::now().to_rfc3339());
    let instruction_size_bytes = artifact_manifest
        .get(INSTRUCTIONS_FILENAME)
        .and_then(|entry| entry.get("size_bytes"))
        .cloned()
        .unwrap_or(json!(0));
    let manifest = json!({
        "package_version": 1,
        "generated_at": generated_at,
        "hash_algorithm": "sha256",
        "manifest_hash": &manifest_hash,
        "run_mode": &run_mode,
        "provider": &provider,
        "source_ids": &input.source_ids,
        "source_versions": &input.source_versions,
        "includes_priorities": artifacts.contains_key(PRIORITIES_FILENAME),
        "instruction_size_bytes": instruction_size_bytes,
        "total_size_bytes": total_size_bytes,
        "artifacts": artifact_manifest,
    });

    warn_on_context_reference_tokens(&artifacts);

    CompiledInstructionPackage {
        run_mode,
        provider,
        artifacts,
        manifest,
        manifest_hash,
    }
}

/// Advisory scan for `@…..…` tokens that look like file-range references.
///
/// Matching tokens are logged; they never fail the compilation.
fn warn_on_context_reference_tokens(artifacts: &BTreeMap<String, String>) {
    for (file_name, content) in artifacts {
        for token in content
            .split_whitespace()
            .filter(|token| token.starts_with('@') && token[1..].contains(".."))
        {
            warn!(
                target: "llmctl_engine::instructions",
                file = %file_name,
                token,
                "rendered markdown contains a context reference token"
            );
        }
    }
}

/// Result of materializing a package to disk.
#[derive(Clone, Debug)]
pub struct MaterializedInstructionPackage {
    pub root: PathBuf,
    /// Absolute paths of every written file, including `manifest.json`.
    pub paths: Vec<String>,
    pub manifest_hash: String,
}

/// Write a compiled package beneath `<workspace>/<instructions_subdir>/`.
///
/// Every file (including the manifest) lands with permission bits 0444. The
/// target directory is replaced wholesale, never merged.
pub fn materialize_instruction_package(
    package: &CompiledInstructionPackage,
    workspace: &Path,
    instructions_subdir: &str,
) -> Result<MaterializedInstructionPackage, InstructionError> {
    let root = workspace.join(instructions_subdir);
    fsutil::replace_tree(&root)?;

    let mut paths = Vec::with_capacity(package.artifacts.len() + 1);
    for (file_name, content) in &package.artifacts {
        let path = root.join(file_name);
        fsutil::write_read_only_file(&path, content.as_bytes())?;
        paths.push(path.to_string_lossy().into_owned());
    }
    let manifest_path = root.join(MANIFEST_FILENAME);
    let manifest_text = serde_json::to_string_pretty(&package.manifest)?;
    fsutil::write_read_only_file(&manifest_path, manifest_text.as_bytes())?;
    paths.push(manifest_path.to_string_lossy().into_owned());

    Ok(MaterializedInstructionPackage {
        root,
        paths,
        manifest_hash: package.manifest_hash.clone(),
    })
}

/// Policy gate: every materialized path must resolve beneath the workspace,
/// the runtime home, or the codex home. A violation aborts the run.
pub fn validate_materialized_paths(
    paths: &[String],
    workspace: &Path,
    runtime_home: &Path,
    codex_home: Option<&Path>,
) -> Result<(), InstructionError> {
    let mut roots: Vec<&Path> = vec![workspace, runtime_home];
    if let Some(codex) = codex_home {
        roots.push(codex);
    }
    for raw in paths {
        let path = Path::new(raw);
        if !fsutil::resolves_under(path, &roots) {
            return Err(InstructionError::PolicyViolation {
                path: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_trailing_whitespace_and_blank_edges() {
        let normalized = normalize_markdown("\n\n# Title  \r\nbody\t\n\n\n");
        assert_eq!(normalized, "# Title\nbody\n");
        assert_eq!(normalize_markdown("   \n  \n"), "");
    }

    #[test]
    fn priorities_emitted_only_for_autorun() {
        let input = InstructionCompileInput::new("task", "codex")
            .with_priorities(vec!["ship it".to_string()]);
        let package = compile_instruction_package(&input);
        assert!(!package.artifacts.contains_key(PRIORITIES_FILENAME));

        let autorun = InstructionCompileInput::new("autorun", "codex")
            .with_priorities(vec!["ship it".to_string()]);
        let package = compile_instruction_package(&autorun);
        assert!(package.artifacts.contains_key(PRIORITIES_FILENAME));
    }

    #[test]
    fn empty_inputs_become_placeholders() {
        let package = compile_instruction_package(&InstructionCompileInput::new("", ""));
        assert_eq!(package.run_mode, "task");
        assert_eq!(package.provider, "unknown");
        assert!(package.artifacts[ROLE_FILENAME].contains("No role instructions resolved."));
        assert!(package.artifacts[AGENT_FILENAME].contains("No agent instructions resolved."));
    }
}
