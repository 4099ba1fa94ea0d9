//! Core domain model shared by the RADAR identity-resolution crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "radar-core";

/// Kind of real-world actor an entity row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Person,
    Lab,
    Organization,
}

/// Roster filter for a resolution sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityScope {
    All,
    Kind(EntityKind),
}

impl EntityScope {
    pub fn admits(&self, kind: EntityKind) -> bool {
        match self {
            EntityScope::All => true,
            EntityScope::Kind(wanted) => *wanted == kind,
        }
    }
}

/// A named actor (researcher, lab, organization) harvested from one or
/// more upstream sources. `(kind, name)` is unique at any instant;
/// duplicates are removed by merging rows, never by renaming them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,
    pub description: Option<String>,
    pub homepage_url: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Affiliation text used by the similarity scorers: the
    /// `metadata["affiliation"]` string when present and non-empty,
    /// otherwise the description, otherwise empty.
    pub fn affiliation_text(&self) -> &str {
        if let Some(affiliation) = self.metadata.get("affiliation").and_then(|v| v.as_str()) {
            let trimmed = affiliation.trim();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.description.as_deref().map(str::trim).unwrap_or("")
    }
}

/// A platform account (github, x, orcid, ...) owned by exactly one entity.
/// `(platform, handle_or_id)` identifies the account to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub entity_id: i64,
    pub platform: String,
    pub handle_or_id: String,
    pub url: Option<String>,
    pub follower_count: Option<i64>,
    #[serde(default)]
    pub raw_json: serde_json::Value,
}

/// A harvested artifact (paper, repository, post) attributed to zero or
/// more entities. Author order is meaningful and must survive merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub title: String,
    pub url: Option<String>,
    pub author_entity_ids: Vec<i64>,
}

/// Roster row: an entity pre-joined with the accounts it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWithAccounts {
    pub entity: Entity,
    pub accounts: Vec<Account>,
}

impl EntityWithAccounts {
    pub fn without_accounts(entity: Entity) -> Self {
        Self {
            entity,
            accounts: Vec::new(),
        }
    }
}

/// Outcome of reviewing one candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeDecision {
    Merge,
    Ignore,
}

impl MergeDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeDecision::Merge => "merge",
            MergeDecision::Ignore => "ignore",
        }
    }
}

/// Append-only audit row journaling a merge or ignore decision. Rows
/// reference entity ids that may no longer exist; they are never joined
/// back to the entity table and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMergeHistory {
    pub id: i64,
    pub primary_entity_id: i64,
    pub candidate_entity_id: i64,
    pub decision: MergeDecision,
    pub similarity_score: f64,
    pub reviewer: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields the caller supplies when journaling a decision; the audit log
/// assigns the row id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMergeHistory {
    pub primary_entity_id: i64,
    pub candidate_entity_id: i64,
    pub decision: MergeDecision,
    pub similarity_score: f64,
    pub reviewer: Option<String>,
    pub notes: Option<String>,
}
