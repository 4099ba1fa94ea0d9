//! Storage contracts for identity resolution: the entity repository
//! read/mutation surface and the append-only merge audit log, plus
//! thread-safe in-memory implementations used by tests and embedded runs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use radar_core::{
    Account, Artifact, Entity, EntityMergeHistory, EntityScope, EntityWithAccounts,
    NewMergeHistory,
};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "radar-storage";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("entity {0} not found")]
    EntityNotFound(i64),
    #[error("merge rejected: {0}")]
    MergeRejected(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

fn lock_err(context: &str) -> RepositoryError {
    RepositoryError::Backend(format!("poisoned lock: {context}"))
}

/// Account ownership rewrite: `account_id` moves to `new_owner_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountReassignment {
    pub account_id: i64,
    pub new_owner_id: i64,
}

/// Full author-list replacement for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorRewrite {
    pub artifact_id: i64,
    pub author_entity_ids: Vec<i64>,
}

/// The low-level mutations making up one entity merge: reassign the
/// duplicate's accounts to the primary, rewrite artifact author lists,
/// and delete the duplicate row. Applied as a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeMutation {
    pub primary_id: i64,
    pub duplicate_id: i64,
    pub reassign_accounts: Vec<AccountReassignment>,
    pub author_rewrites: Vec<AuthorRewrite>,
}

/// Read and mutation surface of the entity collection.
///
/// `commit_merge` must be atomic: the plan is re-validated against current
/// state and then either every mutation lands or none do.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn list_all_entities(
        &self,
        scope: EntityScope,
    ) -> Result<Vec<EntityWithAccounts>, RepositoryError>;

    async fn get_entity(&self, id: i64) -> Result<Option<Entity>, RepositoryError>;

    async fn accounts_owned_by(&self, entity_id: i64) -> Result<Vec<Account>, RepositoryError>;

    async fn artifacts_authored_by(
        &self,
        entity_id: i64,
    ) -> Result<Vec<Artifact>, RepositoryError>;

    async fn commit_merge(&self, mutation: MergeMutation) -> Result<(), RepositoryError>;
}

/// Append-only journal of merge and ignore decisions.
#[async_trait]
pub trait MergeAuditLog: Send + Sync {
    async fn record_merge_history(
        &self,
        entry: NewMergeHistory,
    ) -> Result<i64, RepositoryError>;

    /// Rows touching `entity_id` as primary or candidate, or every row
    /// when no filter is given. Newest last.
    async fn list_merge_history(
        &self,
        entity_id: Option<i64>,
    ) -> Result<Vec<EntityMergeHistory>, RepositoryError>;
}

#[derive(Debug, Default)]
struct RepositoryState {
    entities: HashMap<i64, Entity>,
    accounts: HashMap<i64, Account>,
    artifacts: HashMap<i64, Artifact>,
}

/// In-memory repository guarded by a single `RwLock`, which is what makes
/// `commit_merge` all-or-nothing here. Reference implementation for tests
/// and embedded sweeps; durable persistence lives with the host platform.
#[derive(Debug, Default)]
pub struct InMemoryEntityRepository {
    state: RwLock<RepositoryState>,
}

impl InMemoryEntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed one entity row, replacing any row with the same id.
    pub fn insert_entity(&self, entity: Entity) -> Result<(), RepositoryError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("repository.insert_entity"))?;
        state.entities.insert(entity.id, entity);
        Ok(())
    }

    pub fn insert_account(&self, account: Account) -> Result<(), RepositoryError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("repository.insert_account"))?;
        state.accounts.insert(account.id, account);
        Ok(())
    }

    pub fn insert_artifact(&self, artifact: Artifact) -> Result<(), RepositoryError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("repository.insert_artifact"))?;
        state.artifacts.insert(artifact.id, artifact);
        Ok(())
    }

    pub fn entity_count(&self) -> Result<usize, RepositoryError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("repository.entity_count"))?;
        Ok(state.entities.len())
    }

    pub fn account(&self, id: i64) -> Result<Option<Account>, RepositoryError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("repository.account"))?;
        Ok(state.accounts.get(&id).cloned())
    }

    pub fn artifact(&self, id: i64) -> Result<Option<Artifact>, RepositoryError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("repository.artifact"))?;
        Ok(state.artifacts.get(&id).cloned())
    }
}

fn validate_merge_plan(
    state: &RepositoryState,
    mutation: &MergeMutation,
) -> Result<(), RepositoryError> {
    if mutation.primary_id == mutation.duplicate_id {
        return Err(RepositoryError::MergeRejected(
            "primary and duplicate are the same row".to_string(),
        ));
    }
    if !state.entities.contains_key(&mutation.primary_id) {
        return Err(RepositoryError::EntityNotFound(mutation.primary_id));
    }
    if !state.entities.contains_key(&mutation.duplicate_id) {
        return Err(RepositoryError::EntityNotFound(mutation.duplicate_id));
    }

    for reassignment in &mutation.reassign_accounts {
        if reassignment.new_owner_id != mutation.primary_id {
            return Err(RepositoryError::MergeRejected(format!(
                "account {} would be reassigned to {}, not the primary",
                reassignment.account_id, reassignment.new_owner_id
            )));
        }
        if !state.accounts.contains_key(&reassignment.account_id) {
            return Err(RepositoryError::MergeRejected(format!(
                "account {} does not exist",
                reassignment.account_id
            )));
        }
    }

    for rewrite in &mutation.author_rewrites {
        if !state.artifacts.contains_key(&rewrite.artifact_id) {
            return Err(RepositoryError::MergeRejected(format!(
                "artifact {} does not exist",
                rewrite.artifact_id
            )));
        }
        if rewrite.author_entity_ids.contains(&mutation.duplicate_id) {
            return Err(RepositoryError::MergeRejected(format!(
                "artifact {} author rewrite still references the duplicate",
                rewrite.artifact_id
            )));
        }
        let mut seen = Vec::with_capacity(rewrite.author_entity_ids.len());
        for author in &rewrite.author_entity_ids {
            if seen.contains(author) {
                return Err(RepositoryError::MergeRejected(format!(
                    "artifact {} author rewrite repeats entity {}",
                    rewrite.artifact_id, author
                )));
            }
            seen.push(*author);
        }
    }

    Ok(())
}

#[async_trait]
impl EntityRepository for InMemoryEntityRepository {
    async fn list_all_entities(
        &self,
        scope: EntityScope,
    ) -> Result<Vec<EntityWithAccounts>, RepositoryError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("repository.list_all_entities"))?;

        let mut rows: Vec<EntityWithAccounts> = state
            .entities
            .values()
            .filter(|entity| scope.admits(entity.kind))
            .map(|entity| {
                let mut accounts: Vec<Account> = state
                    .accounts
                    .values()
                    .filter(|account| account.entity_id == entity.id)
                    .cloned()
                    .collect();
                accounts.sort_by_key(|account| account.id);
                EntityWithAccounts {
                    entity: entity.clone(),
                    accounts,
                }
            })
            .collect();
        rows.sort_by_key(|row| row.entity.id);
        Ok(rows)
    }

    async fn get_entity(&self, id: i64) -> Result<Option<Entity>, RepositoryError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("repository.get_entity"))?;
        Ok(state.entities.get(&id).cloned())
    }

    async fn accounts_owned_by(&self, entity_id: i64) -> Result<Vec<Account>, RepositoryError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("repository.accounts_owned_by"))?;
        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|account| account.entity_id == entity_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|account| account.id);
        Ok(accounts)
    }

    async fn artifacts_authored_by(
        &self,
        entity_id: i64,
    ) -> Result<Vec<Artifact>, RepositoryError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("repository.artifacts_authored_by"))?;
        let mut artifacts: Vec<Artifact> = state
            .artifacts
            .values()
            .filter(|artifact| artifact.author_entity_ids.contains(&entity_id))
            .cloned()
            .collect();
        artifacts.sort_by_key(|artifact| artifact.id);
        Ok(artifacts)
    }

    async fn commit_merge(&self, mutation: MergeMutation) -> Result<(), RepositoryError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("repository.commit_merge"))?;

        // Re-validate against current state before touching any row; the
        // plan may be stale by the time it is committed.
        validate_merge_plan(&state, &mutation)?;

        for reassignment in &mutation.reassign_accounts {
            if let Some(account) = state.accounts.get_mut(&reassignment.account_id) {
                account.entity_id = reassignment.new_owner_id;
            }
        }
        for rewrite in &mutation.author_rewrites {
            if let Some(artifact) = state.artifacts.get_mut(&rewrite.artifact_id) {
                artifact.author_entity_ids = rewrite.author_entity_ids.clone();
            }
        }
        state.entities.remove(&mutation.duplicate_id);
        if let Some(primary) = state.entities.get_mut(&mutation.primary_id) {
            primary.updated_at = Utc::now();
        }

        debug!(
            primary_id = mutation.primary_id,
            duplicate_id = mutation.duplicate_id,
            accounts = mutation.reassign_accounts.len(),
            artifacts = mutation.author_rewrites.len(),
            "applied merge mutation"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AuditState {
    next_id: i64,
    rows: Vec<EntityMergeHistory>,
}

/// In-memory append-only audit log.
#[derive(Debug, Default)]
pub struct InMemoryMergeAuditLog {
    state: RwLock<AuditState>,
}

impl InMemoryMergeAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MergeAuditLog for InMemoryMergeAuditLog {
    async fn record_merge_history(
        &self,
        entry: NewMergeHistory,
    ) -> Result<i64, RepositoryError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("audit.record_merge_history"))?;
        state.next_id += 1;
        let id = state.next_id;
        state.rows.push(EntityMergeHistory {
            id,
            primary_entity_id: entry.primary_entity_id,
            candidate_entity_id: entry.candidate_entity_id,
            decision: entry.decision,
            similarity_score: entry.similarity_score,
            reviewer: entry.reviewer,
            notes: entry.notes,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list_merge_history(
        &self,
        entity_id: Option<i64>,
    ) -> Result<Vec<EntityMergeHistory>, RepositoryError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("audit.list_merge_history"))?;
        Ok(state
            .rows
            .iter()
            .filter(|row| match entity_id {
                Some(id) => row.primary_entity_id == id || row.candidate_entity_id == id,
                None => true,
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use radar_core::{EntityKind, MergeDecision};

    fn mk_entity(id: i64, kind: EntityKind, name: &str) -> Entity {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        Entity {
            id,
            kind,
            name: name.to_string(),
            description: None,
            homepage_url: None,
            metadata: serde_json::Value::Null,
            created_at: created,
            updated_at: created,
        }
    }

    fn mk_account(id: i64, entity_id: i64, platform: &str, handle: &str) -> Account {
        Account {
            id,
            entity_id,
            platform: platform.to_string(),
            handle_or_id: handle.to_string(),
            url: None,
            follower_count: None,
            raw_json: serde_json::Value::Null,
        }
    }

    fn mk_artifact(id: i64, title: &str, authors: Vec<i64>) -> Artifact {
        Artifact {
            id,
            title: title.to_string(),
            url: None,
            author_entity_ids: authors,
        }
    }

    fn seeded_repo() -> InMemoryEntityRepository {
        let repo = InMemoryEntityRepository::new();
        repo.insert_entity(mk_entity(1, EntityKind::Person, "John Smith"))
            .expect("seed entity");
        repo.insert_entity(mk_entity(2, EntityKind::Person, "Smith, John"))
            .expect("seed entity");
        repo.insert_entity(mk_entity(8, EntityKind::Person, "Alice Wong"))
            .expect("seed entity");
        repo.insert_account(mk_account(3, 2, "github", "jsmith"))
            .expect("seed account");
        repo.insert_artifact(mk_artifact(7, "Attention Is Not Enough", vec![2, 8]))
            .expect("seed artifact");
        repo
    }

    #[tokio::test]
    async fn commit_merge_applies_every_mutation_atomically() {
        let repo = seeded_repo();
        let before = repo
            .get_entity(1)
            .await
            .expect("read")
            .expect("entity 1")
            .updated_at;

        let mutation = MergeMutation {
            primary_id: 1,
            duplicate_id: 2,
            reassign_accounts: vec![AccountReassignment {
                account_id: 3,
                new_owner_id: 1,
            }],
            author_rewrites: vec![AuthorRewrite {
                artifact_id: 7,
                author_entity_ids: vec![1, 8],
            }],
        };
        repo.commit_merge(mutation).await.expect("merge commits");

        assert!(repo.get_entity(2).await.expect("read").is_none());
        let account = repo.account(3).expect("read").expect("account 3");
        assert_eq!(account.entity_id, 1);
        let artifact = repo.artifact(7).expect("read").expect("artifact 7");
        assert_eq!(artifact.author_entity_ids, vec![1, 8]);
        let primary = repo.get_entity(1).await.expect("read").expect("entity 1");
        assert!(primary.updated_at > before);
    }

    #[tokio::test]
    async fn commit_merge_rejects_missing_duplicate_without_side_effects() {
        let repo = seeded_repo();
        let mutation = MergeMutation {
            primary_id: 1,
            duplicate_id: 9999,
            reassign_accounts: vec![],
            author_rewrites: vec![],
        };

        let err = repo.commit_merge(mutation).await.expect_err("must reject");
        assert!(matches!(err, RepositoryError::EntityNotFound(9999)));
        assert_eq!(repo.entity_count().expect("count"), 3);
        assert_eq!(repo.account(3).expect("read").expect("account").entity_id, 2);
    }

    #[tokio::test]
    async fn commit_merge_rejects_plan_targeting_a_third_entity() {
        let repo = seeded_repo();
        let mutation = MergeMutation {
            primary_id: 1,
            duplicate_id: 2,
            reassign_accounts: vec![AccountReassignment {
                account_id: 3,
                new_owner_id: 8,
            }],
            author_rewrites: vec![],
        };

        let err = repo.commit_merge(mutation).await.expect_err("must reject");
        assert!(matches!(err, RepositoryError::MergeRejected(_)));
        // Nothing applied: the duplicate row and its account survive.
        assert!(repo.get_entity(2).await.expect("read").is_some());
        assert_eq!(repo.account(3).expect("read").expect("account").entity_id, 2);
    }

    #[tokio::test]
    async fn commit_merge_rejects_author_rewrite_that_keeps_the_duplicate() {
        let repo = seeded_repo();
        let mutation = MergeMutation {
            primary_id: 1,
            duplicate_id: 2,
            reassign_accounts: vec![],
            author_rewrites: vec![AuthorRewrite {
                artifact_id: 7,
                author_entity_ids: vec![2, 8],
            }],
        };

        let err = repo.commit_merge(mutation).await.expect_err("must reject");
        assert!(matches!(err, RepositoryError::MergeRejected(_)));
        assert!(repo.get_entity(2).await.expect("read").is_some());
    }

    #[tokio::test]
    async fn list_all_entities_filters_by_scope_and_joins_accounts() {
        let repo = seeded_repo();
        repo.insert_entity(mk_entity(4, EntityKind::Organization, "MIT"))
            .expect("seed entity");

        let people = repo
            .list_all_entities(EntityScope::Kind(EntityKind::Person))
            .await
            .expect("list");
        assert_eq!(people.len(), 3);
        assert!(people.iter().all(|row| row.entity.kind == EntityKind::Person));
        let smith_dup = people
            .iter()
            .find(|row| row.entity.id == 2)
            .expect("entity 2 in roster");
        assert_eq!(smith_dup.accounts.len(), 1);
        assert_eq!(smith_dup.accounts[0].handle_or_id, "jsmith");

        let everyone = repo
            .list_all_entities(EntityScope::All)
            .await
            .expect("list");
        assert_eq!(everyone.len(), 4);
        // Deterministic ordering by id keeps sweeps reproducible.
        let ids: Vec<i64> = everyone.iter().map(|row| row.entity.id).collect();
        assert_eq!(ids, vec![1, 2, 4, 8]);
    }

    #[tokio::test]
    async fn audit_log_appends_and_filters_by_entity() {
        let audit = InMemoryMergeAuditLog::new();
        let first = audit
            .record_merge_history(NewMergeHistory {
                primary_entity_id: 1,
                candidate_entity_id: 2,
                decision: MergeDecision::Merge,
                similarity_score: 0.97,
                reviewer: None,
                notes: Some("auto-merged".to_string()),
            })
            .await
            .expect("record");
        let second = audit
            .record_merge_history(NewMergeHistory {
                primary_entity_id: 5,
                candidate_entity_id: 6,
                decision: MergeDecision::Ignore,
                similarity_score: 0.81,
                reviewer: Some("adjudicator".to_string()),
                notes: None,
            })
            .await
            .expect("record");
        assert!(second > first);

        let all = audit.list_merge_history(None).await.expect("list");
        assert_eq!(all.len(), 2);

        let for_two = audit.list_merge_history(Some(2)).await.expect("list");
        assert_eq!(for_two.len(), 1);
        assert_eq!(for_two[0].decision, MergeDecision::Merge);
        assert_eq!(for_two[0].reviewer, None);

        let for_five = audit.list_merge_history(Some(5)).await.expect("list");
        assert_eq!(for_five.len(), 1);
        assert_eq!(for_five[0].reviewer.as_deref(), Some("adjudicator"));
    }
}
