//! File-backed authorization policy store.

use elevate_contracts::Identity;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

const KEEP_SUFFIX: &str = "_keep";
const WILDCARD: char = '*';

#[derive(Debug, thiserror::Error)]
pub enum PolicyLoadError {
    #[error("failed to read policy store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy store {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid action pattern '{0}'")]
    InvalidPattern(String),
}

/// What a policy entry grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyResult {
    Yes,
    No,
    AuthSelf,
    AuthAdmin,
}

impl PolicyResult {
    fn restrictiveness(self) -> u8 {
        match self {
            Self::Yes => 0,
            Self::AuthSelf => 1,
            Self::AuthAdmin => 2,
            Self::No => 3,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
            Self::AuthSelf => "auth_self",
            Self::AuthAdmin => "auth_admin",
        }
    }
}

/// A policy result plus whether a successful authentication is remembered.
///
/// Written as `yes`, `no`, `auth_self`, `auth_admin`, with an optional
/// `_keep` suffix on the `auth_*` forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PolicyValue {
    pub result: PolicyResult,
    pub keep: bool,
}

impl PolicyValue {
    pub const fn new(result: PolicyResult) -> Self {
        Self {
            result,
            keep: false,
        }
    }

    pub const fn kept(result: PolicyResult) -> Self {
        Self { result, keep: true }
    }

    /// Ordering used to pick among several scoped rules for one pattern.
    pub fn cmp_restrictiveness(&self, other: &Self) -> Ordering {
        self.result
            .restrictiveness()
            .cmp(&other.result.restrictiveness())
            .then_with(|| other.keep.cmp(&self.keep))
    }
}

impl FromStr for PolicyValue {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        let (base, keep) = match normalized.strip_suffix(KEEP_SUFFIX) {
            Some(base) => (base, true),
            None => (normalized.as_str(), false),
        };
        let result = match base {
            "yes" | "authorized" => PolicyResult::Yes,
            "no" | "denied" => PolicyResult::No,
            "auth_self" => PolicyResult::AuthSelf,
            "auth_admin" | "auth_required" => PolicyResult::AuthAdmin,
            _ => return Err(format!("unknown policy result '{raw}'")),
        };
        if keep && matches!(result, PolicyResult::Yes | PolicyResult::No) {
            return Err(format!("'{raw}': only auth_* results can be kept"));
        }
        Ok(Self { result, keep })
    }
}

impl TryFrom<String> for PolicyValue {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PolicyValue> for String {
    fn from(value: PolicyValue) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PolicyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.result.as_str())?;
        if self.keep {
            f.write_str(KEEP_SUFFIX)?;
        }
        Ok(())
    }
}

/// Exact action name or a prefix ending in `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionPattern {
    Exact(String),
    Prefix(String),
}

impl ActionPattern {
    pub fn parse(raw: &str) -> Result<Self, PolicyLoadError> {
        let invalid = || PolicyLoadError::InvalidPattern(raw.to_string());
        match raw.strip_suffix(WILDCARD) {
            Some(prefix) => {
                let valid = prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
                if !valid || prefix.starts_with('.') || prefix.contains("..") {
                    return Err(invalid());
                }
                Ok(Self::Prefix(prefix.to_string()))
            }
            None if elevate_contracts::is_valid_action_name(raw) => {
                Ok(Self::Exact(raw.to_string()))
            }
            None => Err(invalid()),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == name,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }

    /// Exact names beat any wildcard; longer prefixes beat shorter ones.
    fn specificity(&self) -> (bool, usize) {
        match self {
            Self::Exact(exact) => (true, exact.len()),
            Self::Prefix(prefix) => (false, prefix.len()),
        }
    }
}

impl fmt::Display for ActionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(exact),
            Self::Prefix(prefix) => write!(f, "{prefix}{WILDCARD}"),
        }
    }
}

/// Who a `[[rules]]` entry applies to. Both lists empty means everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleScope {
    pub uids: Vec<u32>,
    pub groups: Vec<String>,
}

impl RuleScope {
    pub fn applies_to(&self, identity: &Identity) -> bool {
        if self.uids.is_empty() && self.groups.is_empty() {
            return true;
        }
        self.uids.contains(&identity.uid) || self.groups.iter().any(|g| identity.in_group(g))
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.uids.iter().map(|uid| format!("uid:{uid}")).collect();
        parts.extend(self.groups.iter().map(|group| format!("group:{group}")));
        if parts.is_empty() {
            f.write_str("everyone")
        } else {
            f.write_str(&parts.join(","))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    pub pattern: ActionPattern,
    /// `None` for `[defaults]` entries.
    pub scope: Option<RuleScope>,
    pub value: PolicyValue,
}

/// The entry that decided a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMatch {
    pub pattern: String,
    pub value: PolicyValue,
    pub scoped: bool,
}

#[derive(Deserialize)]
struct RawStore {
    #[serde(default)]
    defaults: BTreeMap<String, PolicyValue>,
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Deserialize)]
struct RawRule {
    action: String,
    #[serde(default)]
    uids: Vec<u32>,
    #[serde(default)]
    groups: Vec<String>,
    result: PolicyValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyStore {
    entries: Vec<PolicyEntry>,
}

impl PolicyStore {
    /// Read the store at `path`. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self, PolicyLoadError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Policy store missing, using empty store");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(PolicyLoadError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::parse(&raw).map_err(|err| match err {
            ParseFailure::Toml(source) => PolicyLoadError::Parse {
                path: path.to_path_buf(),
                source,
            },
            ParseFailure::Load(err) => err,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, PolicyLoadError> {
        Self::parse(raw).map_err(|err| match err {
            ParseFailure::Toml(source) => PolicyLoadError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            },
            ParseFailure::Load(err) => err,
        })
    }

    fn parse(raw: &str) -> Result<Self, ParseFailure> {
        let raw: RawStore = toml::from_str(raw).map_err(ParseFailure::Toml)?;
        let mut entries = Vec::with_capacity(raw.defaults.len() + raw.rules.len());
        for (pattern, value) in raw.defaults {
            entries.push(PolicyEntry {
                pattern: ActionPattern::parse(&pattern).map_err(ParseFailure::Load)?,
                scope: None,
                value,
            });
        }
        for rule in raw.rules {
            entries.push(PolicyEntry {
                pattern: ActionPattern::parse(&rule.action).map_err(ParseFailure::Load)?,
                scope: Some(RuleScope {
                    uids: rule.uids,
                    groups: rule.groups,
                }),
                value: rule.result,
            });
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[PolicyEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry deciding `name` for `identity`.
    ///
    /// The most specific matching pattern wins. At that pattern, scoped
    /// rules applying to the identity beat the default, and several such
    /// rules resolve to the most restrictive result.
    pub fn lookup(&self, identity: &Identity, name: &str) -> Option<StoreMatch> {
        let candidates: Vec<&PolicyEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.pattern.matches(name))
            .filter(|entry| {
                entry
                    .scope
                    .as_ref()
                    .is_none_or(|scope| scope.applies_to(identity))
            })
            .collect();

        let best = candidates
            .iter()
            .map(|entry| entry.pattern.specificity())
            .max()?;
        let at_best = candidates
            .into_iter()
            .filter(|entry| entry.pattern.specificity() == best);

        let mut scoped: Option<&PolicyEntry> = None;
        let mut default: Option<&PolicyEntry> = None;
        for entry in at_best {
            if entry.scope.is_some() {
                let replace = scoped.is_none_or(|current| {
                    entry.value.cmp_restrictiveness(&current.value) == Ordering::Greater
                });
                if replace {
                    scoped = Some(entry);
                }
            } else {
                default = Some(entry);
            }
        }

        let (entry, is_scoped) = match (scoped, default) {
            (Some(entry), _) => (entry, true),
            (None, Some(entry)) => (entry, false),
            (None, None) => return None,
        };
        Some(StoreMatch {
            pattern: entry.pattern.to_string(),
            value: entry.value,
            scoped: is_scoped,
        })
    }
}

enum ParseFailure {
    Toml(toml::de::Error),
    Load(PolicyLoadError),
}
