//! Runtime settings: validation, env bootstrap, and secret handling.
//!
//! Settings are a flat `(key, value)` string map persisted through the
//! integration-setting rows. Defaults come from the environment (via
//! `dotenvy`), stored rows override env, and typed views project the map
//! into the router/provider/scheduler configuration structs.
//!
//! Secret-marked values (the kubeconfig) are ciphered at rest with an
//! `enc:v1:` prefix and never returned to non-runtime callers: plain loads
//! blank them, and the effective-config summary exposes only an `is_set`
//! flag plus a `sha256:` fingerprint.

use std::collections::BTreeMap;

use miette::Diagnostic;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::execution::{ExecutionTimeouts, KubernetesSettings, RouterSettings};

/// Keys whose values are secrets.
pub const SECRET_KEYS: [&str; 1] = ["k8s_kubeconfig"];

/// Cipher prefix marking values encrypted at rest.
pub const CIPHER_PREFIX: &str = "enc:v1:";

/// Settings validation failures.
#[derive(Debug, Error, Diagnostic)]
pub enum SettingsError {
    #[error("provider must be 'workspace' or 'kubernetes', got '{value}'")]
    #[diagnostic(code(llmctl_engine::settings::provider))]
    Provider { value: String },

    #[error("workspace_identity_key '{value}' must match [a-zA-Z0-9_-]+")]
    #[diagnostic(code(llmctl_engine::settings::workspace_identity))]
    WorkspaceIdentity { value: String },

    #[error("{key} must be a non-negative integer, got '{value}'")]
    #[diagnostic(code(llmctl_engine::settings::integer))]
    Integer { key: String, value: String },

    #[error("k8s_image_pull_secrets_json must be a JSON array of names")]
    #[diagnostic(code(llmctl_engine::settings::image_pull_secrets))]
    ImagePullSecrets,

    #[error("cadence unit must be one of minutes/hours/days/weeks, got '{value}'")]
    #[diagnostic(code(llmctl_engine::settings::cadence_unit))]
    CadenceUnit { value: String },
}

/// Reversible cipher applied to secret values at rest.
///
/// The engine ships a marker cipher (hex behind the `enc:v1:` prefix);
/// deployments substitute a real KMS-backed implementation.
pub trait SettingCipher: Send + Sync {
    fn encode(&self, plain: &str) -> String;
    fn decode(&self, stored: &str) -> String;
}

/// Default cipher: `enc:v1:` + hex. Obfuscation-only; see [`SettingCipher`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MarkerCipher;

impl SettingCipher for MarkerCipher {
    fn encode(&self, plain: &str) -> String {
        let mut out = String::with_capacity(CIPHER_PREFIX.len() + plain.len() * 2);
        out.push_str(CIPHER_PREFIX);
        for byte in plain.as_bytes() {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    fn decode(&self, stored: &str) -> String {
        let Some(hex) = stored.strip_prefix(CIPHER_PREFIX) else {
            return stored.to_string();
        };
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        let mut chars = hex.as_bytes().chunks_exact(2);
        for pair in &mut chars {
            let high = (pair[0] as char).to_digit(16);
            let low = (pair[1] as char).to_digit(16);
            match (high, low) {
                (Some(h), Some(l)) => bytes.push((h * 16 + l) as u8),
                _ => return stored.to_string(),
            }
        }
        String::from_utf8(bytes).unwrap_or_else(|_| stored.to_string())
    }
}

fn default_values() -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let defaults = [
        ("provider", "kubernetes"),
        ("workspace_identity_key", "default"),
        ("workspace_fallback_enabled", "false"),
        ("dispatch_timeout_seconds", "120"),
        ("execution_timeout_seconds", "1800"),
        ("log_collection_timeout_seconds", "30"),
        ("cancel_grace_timeout_seconds", "15"),
        ("cancel_force_kill_enabled", "false"),
        ("k8s_namespace", "default"),
        ("k8s_image", "llmctl-executor:latest"),
        ("k8s_in_cluster", "false"),
        ("k8s_service_account", ""),
        ("k8s_gpu_limit", "0"),
        ("k8s_job_ttl_seconds", "1800"),
        ("k8s_image_pull_secrets_json", "[]"),
        ("k8s_kubeconfig", ""),
        ("allow_skill_adapter_fallback", "true"),
        ("embedding_capable", "false"),
        ("scheduler_cadence_value", "1"),
        ("scheduler_cadence_unit", "hours"),
    ];
    for (key, value) in defaults {
        values.insert(key.to_string(), value.to_string());
    }
    values
}

fn env_key(key: &str) -> String {
    format!("LLMCTL_NODE_EXECUTOR_{}", key.to_ascii_uppercase())
}

/// Flat runtime settings map with typed projections.
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    values: BTreeMap<String, String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            values: default_values(),
        }
    }
}

impl RuntimeSettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bootstrap: defaults, then environment overrides, then stored rows.
    ///
    /// Stored rows always win over the environment; secret rows arrive
    /// ciphered and are decoded through the supplied cipher.
    #[must_use]
    pub fn bootstrap(stored: &BTreeMap<String, String>, cipher: &dyn SettingCipher) -> Self {
        dotenvy::dotenv().ok();
        let mut values = default_values();
        for key in values.keys().cloned().collect::<Vec<_>>() {
            if let Ok(env_value) = std::env::var(env_key(&key)) {
                values.insert(key, env_value);
            }
        }
        for (key, value) in stored {
            let decoded = if SECRET_KEYS.contains(&key.as_str()) {
                cipher.decode(value)
            } else {
                value.clone()
            };
            values.insert(key.clone(), decoded);
        }
        Self { values }
    }

    /// Validate and apply updates, returning the rows to persist.
    ///
    /// Secret values come back ciphered; the caller stores them verbatim.
    pub fn save(
        &mut self,
        updates: &BTreeMap<String, String>,
        cipher: &dyn SettingCipher,
    ) -> Result<BTreeMap<String, String>, SettingsError> {
        validate_updates(updates)?;
        let mut persisted = BTreeMap::new();
        for (key, value) in updates {
            self.values.insert(key.clone(), value.clone());
            let stored = if SECRET_KEYS.contains(&key.as_str()) && !value.is_empty() {
                cipher.encode(value)
            } else {
                value.clone()
            };
            persisted.insert(key.clone(), stored);
        }
        Ok(persisted)
    }

    /// Raw value lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn get_bool(&self, key: &str) -> bool {
        matches!(
            self.values.get(key).map(String::as_str),
            Some("1" | "true" | "yes" | "on")
        )
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.values
            .get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Settings map with secrets blanked, for non-runtime callers.
    #[must_use]
    pub fn redacted(&self) -> BTreeMap<String, String> {
        let mut out = self.values.clone();
        for key in SECRET_KEYS {
            if out.contains_key(key) {
                out.insert(key.to_string(), String::new());
            }
        }
        out
    }

    /// Full map including secret plain text; runtime callers only.
    #[must_use]
    pub fn runtime_values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Effective-config summary with secret fingerprints instead of values.
    #[must_use]
    pub fn effective_config_summary(&self) -> BTreeMap<String, String> {
        let mut summary = self.redacted();
        for key in SECRET_KEYS {
            let value = self.values.get(key).map(String::as_str).unwrap_or("");
            summary.insert(
                format!("{key}_is_set"),
                if value.is_empty() { "false" } else { "true" }.to_string(),
            );
            if !value.is_empty() {
                let mut hasher = Sha256::new();
                hasher.update(value.as_bytes());
                summary.insert(
                    format!("{key}_fingerprint"),
                    format!("sha256:{:x}", hasher.finalize()),
                );
            }
            summary.remove(key);
        }
        summary
    }

    // ------------------------------------------------------------------
    // Typed projections
    // ------------------------------------------------------------------

    #[must_use]
    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            provider: self.get_or("provider", "kubernetes"),
            workspace_identity_key: self.get_or("workspace_identity_key", "default"),
            workspace_fallback_enabled: self.get_bool("workspace_fallback_enabled"),
        }
    }

    #[must_use]
    pub fn kubernetes_settings(&self) -> KubernetesSettings {
        let image_pull_secrets = self
            .values
            .get("k8s_image_pull_secrets_json")
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|value| {
                value.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
            })
            .unwrap_or_default();
        let kubeconfig = self
            .values
            .get("k8s_kubeconfig")
            .filter(|value| !value.trim().is_empty())
            .cloned();
        KubernetesSettings {
            namespace: self.get_or("k8s_namespace", "default"),
            image: self.get_or("k8s_image", "llmctl-executor:latest"),
            in_cluster: self.get_bool("k8s_in_cluster"),
            service_account: self.get_or("k8s_service_account", ""),
            gpu_limit: self.get_u64("k8s_gpu_limit", 0) as u32,
            job_ttl_seconds: self.get_u64("k8s_job_ttl_seconds", 1800),
            image_pull_secrets,
            kubeconfig,
            cancel_force_kill: self.get_bool("cancel_force_kill_enabled"),
        }
    }

    #[must_use]
    pub fn timeouts(&self) -> ExecutionTimeouts {
        ExecutionTimeouts {
            dispatch_timeout_seconds: self.get_u64("dispatch_timeout_seconds", 120),
            execution_timeout_seconds: self.get_u64("execution_timeout_seconds", 1800),
            log_collection_timeout_seconds: self.get_u64("log_collection_timeout_seconds", 30),
            cancel_grace_timeout_seconds: self.get_u64("cancel_grace_timeout_seconds", 15),
        }
    }

    /// Scheduler cadence `(value, unit)`.
    #[must_use]
    pub fn scheduler_cadence(&self) -> (u32, String) {
        (
            self.get_u64("scheduler_cadence_value", 1) as u32,
            self.get_or("scheduler_cadence_unit", "hours"),
        )
    }

    #[must_use]
    pub fn allow_skill_adapter_fallback(&self) -> bool {
        self.get_bool("allow_skill_adapter_fallback")
    }

    #[must_use]
    pub fn embedding_capable(&self) -> bool {
        self.get_bool("embedding_capable")
    }

    /// Instruction policy flag for a provider (`native` or `fallback`).
    #[must_use]
    pub fn instruction_policy_enabled(&self, kind: &str, provider: &str) -> bool {
        let key = format!("instruction_{kind}_enabled_{provider}");
        // Instruction materialization defaults on for every provider.
        self.values
            .get(&key)
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(true)
    }
}

const CADENCE_UNITS: [&str; 4] = ["minutes", "hours", "days", "weeks"];

fn validate_updates(updates: &BTreeMap<String, String>) -> Result<(), SettingsError> {
    if let Some(provider) = updates.get("provider") {
        if provider != "workspace" && provider != "kubernetes" {
            return Err(SettingsError::Provider {
                value: provider.clone(),
            });
        }
    }
    if let Some(identity) = updates.get("workspace_identity_key") {
        let valid = !identity.is_empty()
            && identity
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !valid {
            return Err(SettingsError::WorkspaceIdentity {
                value: identity.clone(),
            });
        }
    }
    for key in [
        "dispatch_timeout_seconds",
        "execution_timeout_seconds",
        "log_collection_timeout_seconds",
        "cancel_grace_timeout_seconds",
        "k8s_gpu_limit",
        "k8s_job_ttl_seconds",
        "scheduler_cadence_value",
    ] {
        if let Some(value) = updates.get(key) {
            if value.trim().parse::<u64>().is_err() {
                return Err(SettingsError::Integer {
                    key: key.to_string(),
                    value: value.clone(),
                });
            }
        }
    }
    if let Some(raw) = updates.get("k8s_image_pull_secrets_json") {
        let parsed: Result<Value, _> = serde_json::from_str(raw);
        let is_array = parsed.map(|value| value.is_array()).unwrap_or(false);
        if !is_array {
            return Err(SettingsError::ImagePullSecrets);
        }
    }
    if let Some(unit) = updates.get("scheduler_cadence_unit") {
        if !CADENCE_UNITS.contains(&unit.as_str()) {
            return Err(SettingsError::CadenceUnit { value: unit.clone() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updates(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn save_rejects_unknown_provider_and_bad_identity() {
        let mut settings = RuntimeSettings::new();
        let cipher = MarkerCipher;
        assert!(matches!(
            settings.save(&updates(&[("provider", "docker")]), &cipher),
            Err(SettingsError::Provider { .. })
        ));
        assert!(matches!(
            settings.save(&updates(&[("workspace_identity_key", "/tmp/workspace")]), &cipher),
            Err(SettingsError::WorkspaceIdentity { .. })
        ));
        assert!(matches!(
            settings.save(&updates(&[("k8s_image_pull_secrets_json", "{}")]), &cipher),
            Err(SettingsError::ImagePullSecrets)
        ));
    }

    #[test]
    fn secrets_are_ciphered_redacted_and_fingerprinted() {
        let mut settings = RuntimeSettings::new();
        let cipher = MarkerCipher;
        let persisted = settings
            .save(&updates(&[("k8s_kubeconfig", "apiVersion: v1")]), &cipher)
            .unwrap();
        assert!(persisted["k8s_kubeconfig"].starts_with(CIPHER_PREFIX));

        assert_eq!(settings.redacted()["k8s_kubeconfig"], "");
        assert_eq!(
            settings.runtime_values()["k8s_kubeconfig"],
            "apiVersion: v1"
        );
        let summary = settings.effective_config_summary();
        assert_eq!(summary["k8s_kubeconfig_is_set"], "true");
        assert!(summary["k8s_kubeconfig_fingerprint"].starts_with("sha256:"));
    }

    #[test]
    fn marker_cipher_round_trips() {
        let cipher = MarkerCipher;
        let encoded = cipher.encode("secret value");
        assert!(encoded.starts_with(CIPHER_PREFIX));
        assert_eq!(cipher.decode(&encoded), "secret value");
    }

    #[test]
    fn typed_projections_read_the_map() {
        let mut settings = RuntimeSettings::new();
        let cipher = MarkerCipher;
        settings
            .save(
                &updates(&[
                    ("provider", "kubernetes"),
                    ("k8s_gpu_limit", "2"),
                    ("k8s_job_ttl_seconds", "2400"),
                    ("workspace_identity_key", "workspace-prod"),
                ]),
                &cipher,
            )
            .unwrap();
        let k8s = settings.kubernetes_settings();
        assert_eq!(k8s.gpu_limit, 2);
        assert_eq!(k8s.job_ttl_seconds, 2400);
        assert_eq!(settings.router_settings().workspace_identity_key, "workspace-prod");
    }
}
