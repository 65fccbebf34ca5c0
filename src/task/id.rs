// src/task/id.rs

//! Task identities.
//!
//! An identity is either authored (`namespace.name`) or derived from the
//! task family and its parameters, so that two instances of the same
//! template with the same parameters always collapse onto one key.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::params::Params;

/// How many parameters (sorted by name) contribute to the readable summary.
const ID_INCLUDE_PARAMS: usize = 3;
/// Each summarised parameter value is cut to this many characters.
const ID_TRUNCATE_PARAMS: usize = 16;
/// Hex characters of the digest kept in the id.
const ID_TRUNCATE_HASH: usize = 10;

static ID_INVALID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("static regex is valid"));

/// Stable key of a task, unique within its flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// `namespace.name`, or just `name` when the namespace is empty.
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{namespace}.{name}"))
        }
    }

    /// Content-derived identity: `<family>_<summary>_<digest>`.
    ///
    /// The summary keeps ids readable in logs; the digest covers every
    /// parameter so ids stay unique even when summaries collide.
    pub fn derived(family: &str, params: &Params) -> Self {
        let summary = params
            .iter()
            .take(ID_INCLUDE_PARAMS)
            .map(|(_, value)| value.chars().take(ID_TRUNCATE_PARAMS).collect::<String>())
            .collect::<Vec<_>>()
            .join("_");
        let summary = ID_INVALID_CHARS.replace_all(&summary, "_");

        let digest = blake3::hash(&params.canonical_bytes()).to_hex();
        let digest = &digest.as_str()[..ID_TRUNCATE_HASH];

        Self(format!("{family}_{summary}_{digest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
