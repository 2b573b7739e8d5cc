//! Helper manifests and the action→helper registry.
//!
//! Every `*.toml` file in the helpers directory describes one helper:
//!
//! ```toml
//! id = "org.example.helper"
//! executable = "/usr/libexec/elevate/example-helper"
//! idle_timeout_secs = 30
//! max_concurrent = 2
//!
//! [[actions]]
//! name = "org.example.write"
//! description = "Write a system file"
//! message = "Authentication is required to write system files"
//! policy = "auth_admin_keep"
//! ```

use crate::policy::PolicyValue;
use anyhow::{Context, Result, bail};
use elevate_contracts::{Action, is_valid_action_name};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MANIFEST_EXTENSION: &str = "toml";

fn default_max_concurrent() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionManifest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Prompt text used when the client did not provide one.
    #[serde(default)]
    pub message: Option<String>,
    /// Default policy when the policy store has no matching entry.
    #[serde(default)]
    pub policy: Option<PolicyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperManifest {
    pub id: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub actions: Vec<ActionManifest>,
}

impl HelperManifest {
    pub fn from_toml(raw: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_action_name(&self.id) {
            bail!("Invalid helper id '{}'", self.id);
        }
        if self.executable.as_os_str().is_empty() {
            bail!("Helper '{}' has no executable", self.id);
        }
        if self.max_concurrent == 0 {
            bail!("Helper '{}' must allow at least one request", self.id);
        }
        for action in &self.actions {
            if !is_valid_action_name(&action.name) {
                bail!("Helper '{}' declares invalid action '{}'", self.id, action.name);
            }
        }
        Ok(())
    }

    pub fn action(&self, name: &str) -> Option<&ActionManifest> {
        self.actions.iter().find(|action| action.name == name)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// An action resolved to the helper that serves it.
#[derive(Debug, Clone)]
pub struct ResolvedAction {
    pub helper: Arc<HelperManifest>,
    pub action: ActionManifest,
}

/// Read-only view of all installed helpers.
#[derive(Debug, Clone, Default)]
pub struct HelperRegistry {
    helpers: BTreeMap<String, Arc<HelperManifest>>,
    owners: HashMap<String, String>,
}

impl HelperRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every manifest in `dir`. A missing directory is an empty
    /// registry; unreadable or invalid manifests are skipped with a warning.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();
        if !dir.exists() {
            debug!(path = %dir.display(), "Helpers directory does not exist");
            return Ok(registry);
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == MANIFEST_EXTENSION))
            .collect();
        files.sort();

        for path in files {
            let manifest = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| HelperManifest::from_toml(&raw));
            match manifest {
                Ok(manifest) => registry.insert(manifest),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping invalid helper manifest");
                }
            }
        }
        Ok(registry)
    }

    /// Add a helper. A duplicate helper id, or an action already owned by
    /// another helper, is ignored with a warning.
    pub fn insert(&mut self, manifest: HelperManifest) {
        if self.helpers.contains_key(&manifest.id) {
            warn!(helper_id = %manifest.id, "Duplicate helper id, keeping the first manifest");
            return;
        }
        for action in &manifest.actions {
            match self.owners.get(&action.name) {
                Some(owner) => warn!(
                    action = %action.name,
                    owner = %owner,
                    helper_id = %manifest.id,
                    "Action already registered by another helper"
                ),
                None => {
                    self.owners.insert(action.name.clone(), manifest.id.clone());
                }
            }
        }
        self.helpers.insert(manifest.id.clone(), Arc::new(manifest));
    }

    pub fn helper(&self, id: &str) -> Option<Arc<HelperManifest>> {
        self.helpers.get(id).cloned()
    }

    pub fn helpers(&self) -> impl Iterator<Item = &Arc<HelperManifest>> {
        self.helpers.values()
    }

    /// Resolve an action to its helper. An explicit `helper_id` must name a
    /// helper that declares the action.
    pub fn resolve(&self, action: &Action) -> Option<ResolvedAction> {
        let helper = if action.has_helper() {
            self.helpers.get(&action.helper_id)?
        } else {
            let owner = self.owners.get(&action.name)?;
            self.helpers.get(owner)?
        };
        let manifest = helper.action(&action.name)?.clone();
        Some(ResolvedAction {
            helper: helper.clone(),
            action: manifest,
        })
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.owners.contains_key(name)
    }

    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.owners.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyResult;

    const WRITE_HELPER: &str = r#"
id = "org.example.helper"
executable = "/usr/libexec/example-helper"
max_concurrent = 2

[[actions]]
name = "org.example.write"
message = "Writing requires authentication"
policy = "auth_admin_keep"

[[actions]]
name = "org.example.read"
"#;

    #[test]
    fn test_manifest_parses_actions_and_defaults() {
        let manifest = HelperManifest::from_toml(WRITE_HELPER).unwrap();
        assert_eq!(manifest.id, "org.example.helper");
        assert_eq!(manifest.max_concurrent, 2);
        assert!(manifest.args.is_empty());
        assert_eq!(manifest.idle_timeout(), None);

        let write = manifest.action("org.example.write").unwrap();
        let policy = write.policy.unwrap();
        assert_eq!(policy.result, PolicyResult::AuthAdmin);
        assert!(policy.keep);
        assert!(manifest.action("org.example.read").unwrap().policy.is_none());
    }

    #[test]
    fn test_manifest_rejects_bad_names() {
        let raw = r#"
id = "org.example.helper"
executable = "/bin/true"

[[actions]]
name = "org..broken"
"#;
        assert!(HelperManifest::from_toml(raw).is_err());
    }

    #[test]
    fn test_load_dir_skips_invalid_manifests() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("good.toml"), WRITE_HELPER).unwrap();
        std::fs::write(temp.path().join("bad.toml"), "id = ").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let registry = HelperRegistry::load_dir(temp.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.action_names(),
            vec!["org.example.read", "org.example.write"]
        );
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let registry = HelperRegistry::load_dir(&temp.path().join("none")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_by_name_and_explicit_helper() {
        let mut registry = HelperRegistry::empty();
        registry.insert(HelperManifest::from_toml(WRITE_HELPER).unwrap());

        let resolved = registry.resolve(&Action::new("org.example.write")).unwrap();
        assert_eq!(resolved.helper.id, "org.example.helper");

        let explicit = Action::new("org.example.write").with_helper("org.example.helper");
        assert!(registry.resolve(&explicit).is_some());

        let wrong_helper = Action::new("org.example.write").with_helper("org.other.helper");
        assert!(registry.resolve(&wrong_helper).is_none());
        assert!(registry.resolve(&Action::new("org.example.delete")).is_none());
    }

    #[test]
    fn test_first_owner_of_an_action_wins() {
        let mut registry = HelperRegistry::empty();
        registry.insert(HelperManifest::from_toml(WRITE_HELPER).unwrap());
        registry.insert(
            HelperManifest::from_toml(
                r#"
id = "org.other.helper"
executable = "/bin/other"

[[actions]]
name = "org.example.write"
"#,
            )
            .unwrap(),
        );

        let resolved = registry.resolve(&Action::new("org.example.write")).unwrap();
        assert_eq!(resolved.helper.id, "org.example.helper");
    }
}
