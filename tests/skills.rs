use std::fs;

use llmctl_engine::model::{Skill, SkillBinding, SkillFile, SkillVersion};
use llmctl_engine::skills::{
    SKILL_FALLBACK_MAX_PER_SKILL_BYTES, build_skill_fallback_entries, materialize_skill_set,
    resolve_skill_set, skill_ids_payload, skill_versions_payload,
};

fn skill_file(path: &str, content: &str) -> SkillFile {
    SkillFile {
        path: path.to_string(),
        content: content.to_string(),
        checksum: String::new(),
        size_bytes: 0,
    }
}

fn skill(id: i64, name: &str, versions: Vec<SkillVersion>) -> Skill {
    Skill {
        id,
        name: name.to_string(),
        display_name: name.to_uppercase(),
        description: format!("{name} description"),
        versions,
    }
}

fn version(id: i64, skill_id: i64, version: &str, files: Vec<SkillFile>) -> SkillVersion {
    SkillVersion {
        id,
        skill_id,
        version: version.to_string(),
        manifest_hash: String::new(),
        files,
    }
}

fn binding(skill_id: i64, position: Option<i64>) -> SkillBinding {
    SkillBinding { skill_id, position }
}

#[test]
fn resolution_orders_by_position_name_then_id() {
    let skills = vec![
        skill(3, "zeta", vec![version(30, 3, "1.0", vec![skill_file("SKILL.md", "z")])]),
        skill(1, "alpha", vec![version(10, 1, "1.0", vec![skill_file("SKILL.md", "a")])]),
        skill(2, "beta", vec![version(20, 2, "1.0", vec![skill_file("SKILL.md", "b")])]),
    ];
    // zeta is pinned first by position; alpha/beta fall back to name order.
    let bindings = vec![binding(3, Some(0)), binding(1, None), binding(2, None)];
    let resolved = resolve_skill_set(&skills, &bindings).unwrap();
    let names: Vec<&str> = resolved.skills.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["zeta", "alpha", "beta"]);
    assert_eq!(skill_ids_payload(&resolved), vec![3, 1, 2]);
}

#[test]
fn resolution_picks_the_highest_version_and_computes_checksums() {
    let skills = vec![skill(
        1,
        "notes",
        vec![
            version(10, 1, "1.0", vec![skill_file("SKILL.md", "old")]),
            version(11, 1, "1.1", vec![skill_file("SKILL.md", "new content")]),
        ],
    )];
    let resolved = resolve_skill_set(&skills, &[binding(1, Some(0))]).unwrap();
    let skill = &resolved.skills[0];
    assert_eq!(skill.version_id, 11);
    assert_eq!(skill.version, "1.1");
    let file = &skill.files[0];
    assert_eq!(file.size_bytes, "new content".len() as u64);
    assert_eq!(file.checksum.len(), 64);
    assert!(!skill.manifest_hash.is_empty());
    assert!(!resolved.manifest_hash.is_empty());

    let payload = skill_versions_payload(&resolved);
    assert_eq!(payload[0]["version_id"], 11);
}

#[test]
fn missing_skill_md_fails_resolution() {
    let skills = vec![skill(
        1,
        "broken",
        vec![version(10, 1, "1.0", vec![skill_file("README.md", "x")])],
    )];
    assert!(resolve_skill_set(&skills, &[binding(1, None)]).is_err());
}

#[test]
fn unsafe_file_paths_fail_resolution() {
    let skills = vec![skill(
        1,
        "escapey",
        vec![version(
            10,
            1,
            "1.0",
            vec![skill_file("SKILL.md", "ok"), skill_file("../outside.md", "bad")],
        )],
    )];
    assert!(resolve_skill_set(&skills, &[binding(1, None)]).is_err());
}

#[test]
fn stored_manifest_hash_is_preferred() {
    let mut pinned = version(10, 1, "1.0", vec![skill_file("SKILL.md", "body")]);
    pinned.manifest_hash = "pinned-hash".to_string();
    let skills = vec![skill(1, "pinned", vec![pinned])];
    let resolved = resolve_skill_set(&skills, &[binding(1, None)]).unwrap();
    assert_eq!(resolved.skills[0].manifest_hash, "pinned-hash");
}

#[test]
fn fallback_entries_truncate_per_skill_and_total_budgets() {
    let big = "x".repeat(SKILL_FALLBACK_MAX_PER_SKILL_BYTES + 5_000);
    let skills = vec![
        skill(1, "a", vec![version(10, 1, "1.0", vec![skill_file("SKILL.md", &big)])]),
        skill(2, "b", vec![version(20, 2, "1.0", vec![skill_file("SKILL.md", &big)])]),
        skill(3, "c", vec![version(30, 3, "1.0", vec![skill_file("SKILL.md", &big)])]),
    ];
    let bindings = vec![binding(1, Some(0)), binding(2, Some(1)), binding(3, Some(2))];
    let resolved = resolve_skill_set(&skills, &bindings).unwrap();
    let entries = build_skill_fallback_entries(&resolved);

    for entry in &entries {
        assert!(entry.content.len() <= SKILL_FALLBACK_MAX_PER_SKILL_BYTES);
    }
    let total: usize = entries.iter().map(|entry| entry.content.len()).sum();
    assert!(total <= llmctl_engine::skills::SKILL_FALLBACK_MAX_TOTAL_BYTES);
    // 12k + 12k exhausts most of the 32k budget; the third entry is clipped.
    assert_eq!(entries.len(), 3);
    assert!(entries[2].content.len() < SKILL_FALLBACK_MAX_PER_SKILL_BYTES);
}

#[test]
fn native_adapter_materializes_workspace_and_home_trees_read_only() {
    let workspace = tempfile::tempdir().unwrap();
    let runtime_home = tempfile::tempdir().unwrap();
    let skills = vec![skill(
        1,
        "guides",
        vec![version(
            10,
            1,
            "1.0",
            vec![skill_file("SKILL.md", "# Guide"), skill_file("docs/more.md", "details")],
        )],
    )];
    let resolved = resolve_skill_set(&skills, &[binding(1, Some(0))]).unwrap();

    let result = materialize_skill_set(
        &resolved,
        "claude",
        workspace.path(),
        runtime_home.path(),
        None,
        true,
    )
    .unwrap();

    assert_eq!(result.mode, "native");
    assert_eq!(result.adapter, "claude_code");
    assert!(result.fallback_entries.is_empty());
    assert_eq!(result.materialized_paths.len(), 2);

    let workspace_file = workspace.path().join(".llmctl/skills/guides/SKILL.md");
    let home_file = runtime_home.path().join(".claude/skills/guides/docs/more.md");
    for path in [&workspace_file, &home_file] {
        assert!(path.exists(), "{} missing", path.display());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o222, 0, "{} is writable", path.display());
        }
    }
}

#[test]
fn fallback_adapter_skips_home_tree_and_attaches_entries() {
    let workspace = tempfile::tempdir().unwrap();
    let runtime_home = tempfile::tempdir().unwrap();
    let skills = vec![skill(
        1,
        "guides",
        vec![version(10, 1, "1.0", vec![skill_file("SKILL.md", "# Guide")])],
    )];
    let resolved = resolve_skill_set(&skills, &[binding(1, None)]).unwrap();

    let result = materialize_skill_set(
        &resolved,
        "vllm",
        workspace.path(),
        runtime_home.path(),
        None,
        true,
    )
    .unwrap();

    assert_eq!(result.mode, "fallback");
    assert_eq!(result.adapter, "prompt_fallback");
    assert_eq!(result.fallback_entries.len(), 1);
    assert_eq!(result.fallback_entries[0].content, "# Guide");
    assert!(workspace.path().join(".llmctl/skills/guides/SKILL.md").exists());
    assert!(!runtime_home.path().join(".claude").exists());
}

#[test]
fn empty_skill_set_materializes_nothing() {
    let workspace = tempfile::tempdir().unwrap();
    let runtime_home = tempfile::tempdir().unwrap();
    let resolved = resolve_skill_set(&[], &[]).unwrap();
    let result = materialize_skill_set(
        &resolved,
        "codex",
        workspace.path(),
        runtime_home.path(),
        None,
        true,
    )
    .unwrap();
    assert!(result.materialized_paths.is_empty());
    assert!(!workspace.path().join(".llmctl").exists());
}
