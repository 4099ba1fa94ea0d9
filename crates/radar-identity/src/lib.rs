//! Identity resolution over harvested entities: name and affiliation
//! scoring, candidate matching, atomic merges, and the sweep pipeline
//! that ties them together.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{
    Entity, EntityScope, EntityWithAccounts, MergeDecision, NewMergeHistory,
};
use radar_embedding::{cosine_similarity, EmbeddingError, EmbeddingService};
use radar_storage::{
    AccountReassignment, AuthorRewrite, EntityRepository, MergeAuditLog, MergeMutation,
    RepositoryError,
};
use serde::Serialize;
use strsim::jaro_winkler;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "radar-identity";

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.75;
pub const DEFAULT_AUTO_MERGE_THRESHOLD: f64 = 0.95;
pub const DEFAULT_BATCH_SIZE: usize = 32;

const HONORIFICS: [&str; 5] = ["dr", "prof", "mr", "mrs", "ms"];

/// Canonical lowercase form of a display name: honorific titles removed,
/// whitespace collapsed, case folded. Token order is preserved; reordering
/// is the scorer's concern, which keeps this form usable for exact lookups.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .filter(|token| {
            let bare = token.trim_end_matches('.');
            !HONORIFICS.iter().any(|h| bare.eq_ignore_ascii_case(h))
        })
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

const EXACT_SET_WEIGHT: f64 = 0.35;
const TOLERANT_COVERAGE_WEIGHT: f64 = 0.65;
const MIN_FUZZY_TOKEN_LEN: usize = 3;
const FUZZY_TOKEN_THRESHOLD: f64 = 0.92;

/// Similarity in `[0, 1]` between two display names, tolerant of token
/// reordering ("Smith, John" vs "John Smith"), comma noise, initials
/// ("J. Smith" vs "John Smith"), and close spellings. Blends exact
/// token-set overlap with a coverage ratio under per-token tolerance.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let norm_a = normalize_name(a);
    let norm_b = normalize_name(b);
    if norm_a.is_empty() || norm_b.is_empty() {
        return 0.0;
    }
    if norm_a == norm_b {
        return 1.0;
    }

    let tokens_a: BTreeSet<String> = name_tokens(&norm_a).into_iter().collect();
    let tokens_b: BTreeSet<String> = name_tokens(&norm_b).into_iter().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let shared = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    let exact_overlap = shared as f64 / union as f64;

    let matched_a = tokens_a
        .iter()
        .filter(|token| tokens_b.iter().any(|other| tokens_match(token, other)))
        .count();
    let matched_b = tokens_b
        .iter()
        .filter(|token| tokens_a.iter().any(|other| tokens_match(token, other)))
        .count();
    let coverage = (matched_a + matched_b) as f64 / (tokens_a.len() + tokens_b.len()) as f64;

    EXACT_SET_WEIGHT * exact_overlap + TOLERANT_COVERAGE_WEIGHT * coverage
}

fn name_tokens(normalized: &str) -> Vec<String> {
    normalized
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(|token| token.trim_matches('.'))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn tokens_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (single_initial(a), single_initial(b)) {
        (Some(ia), Some(ib)) => return ia == ib,
        (Some(ia), None) => return b.starts_with(ia),
        (None, Some(ib)) => return a.starts_with(ib),
        (None, None) => {}
    }
    a.chars().count() >= MIN_FUZZY_TOKEN_LEN
        && b.chars().count() >= MIN_FUZZY_TOKEN_LEN
        && jaro_winkler(a, b) >= FUZZY_TOKEN_THRESHOLD
}

fn single_initial(token: &str) -> Option<char> {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_alphabetic() => Some(c),
        _ => None,
    }
}

const DEPARTMENT_KEYWORDS: [&str; 15] = [
    "department",
    "dept",
    "school",
    "college",
    "faculty",
    "institute",
    "laboratory",
    "lab",
    "center",
    "centre",
    "division",
    "unit",
    "group",
    "program",
    "office",
];

/// Canonical lowercase form of an affiliation string. Comma-separated
/// department and unit suffixes are dropped; the leading institution name
/// and non-departmental qualifiers ("Berkeley") are kept.
pub fn normalize_affiliation(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut segments = lowered.split(',');
    let Some(first) = segments.next() else {
        return String::new();
    };

    let mut kept: Vec<&str> = vec![first.trim()];
    for segment in segments {
        let trimmed = segment.trim();
        if trimmed.is_empty() || segment_is_departmental(trimmed) {
            continue;
        }
        kept.push(trimmed);
    }
    kept.retain(|segment| !segment.is_empty());
    kept.join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn segment_is_departmental(segment: &str) -> bool {
    segment
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()))
        .any(|word| DEPARTMENT_KEYWORDS.contains(&word))
}

/// Similarity in `[0, 1]` between two raw affiliation strings: both are
/// normalized, embedded, and compared by cosine. Either side normalizing
/// to empty scores 0.0 without touching the embedding service.
pub async fn affiliation_similarity(
    embedding: &dyn EmbeddingService,
    a: &str,
    b: &str,
) -> Result<f64, EmbeddingError> {
    let norm_a = normalize_affiliation(a);
    let norm_b = normalize_affiliation(b);
    if norm_a.is_empty() || norm_b.is_empty() {
        return Ok(0.0);
    }

    let inputs = vec![norm_a, norm_b];
    let vectors = embedding.embed_batch(&inputs).await?;
    if vectors.len() != 2 {
        return Err(EmbeddingError::Decode(format!(
            "expected 2 embeddings, got {}",
            vectors.len()
        )));
    }
    cosine_similarity(&vectors[0], &vectors[1])
}

/// Host part of a homepage URL, lowercased, with any `www.` prefix
/// removed. None when no plausible host is present.
pub fn homepage_domain(url: &str) -> Option<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    let without_scheme = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    let authority = without_scheme
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or("");
    let host = authority.rsplit('@').next().unwrap_or("");
    let host = host.split(':').next().unwrap_or("").trim().to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() || host.contains(char::is_whitespace) {
        None
    } else {
        Some(host)
    }
}

fn shared_domain(a: &Entity, b: &Entity) -> bool {
    match (
        a.homepage_url.as_deref().and_then(homepage_domain),
        b.homepage_url.as_deref().and_then(homepage_domain),
    ) {
        (Some(da), Some(db)) => da == db,
        _ => false,
    }
}

/// Signal weights for the combined candidate score:
/// `name * name_similarity + affiliation * affiliation_similarity`, plus
/// `domain_bonus` when both homepages resolve to the same domain. The sum
/// is clamped to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchWeights {
    pub name: f64,
    pub affiliation: f64,
    pub domain_bonus: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            name: 0.6,
            affiliation: 0.25,
            domain_bonus: 0.15,
        }
    }
}

/// One scored probe/candidate pair with its signal breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMatch {
    pub entity_id: i64,
    pub entity_name: String,
    pub weighted_score: f64,
    pub name_similarity: f64,
    pub affiliation_similarity: f64,
    pub domain_bonus: f64,
}

/// Scores a probe entity against a roster and surfaces likely duplicates.
pub struct CandidateMatcher {
    embedding: Arc<dyn EmbeddingService>,
    weights: MatchWeights,
    batch_size: usize,
}

impl CandidateMatcher {
    pub fn new(embedding: Arc<dyn EmbeddingService>) -> Self {
        Self {
            embedding,
            weights: MatchWeights::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_weights(mut self, weights: MatchWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Score `probe` against every other same-kind entity in `roster` and
    /// return the pairs at or above `threshold`, best first, ties broken by
    /// ascending entity id. Never fails: pairs whose affiliation vectors
    /// cannot be obtained are skipped with a warning.
    pub async fn find_candidate_matches(
        &self,
        probe: &EntityWithAccounts,
        roster: &[EntityWithAccounts],
        threshold: f64,
    ) -> Vec<CandidateMatch> {
        let mut memo = HashMap::new();
        self.find_candidates_memoized(probe, roster, threshold, &mut memo)
            .await
    }

    pub(crate) async fn find_candidates_memoized(
        &self,
        probe: &EntityWithAccounts,
        roster: &[EntityWithAccounts],
        threshold: f64,
        memo: &mut HashMap<String, Vec<f32>>,
    ) -> Vec<CandidateMatch> {
        let probe_id = probe.entity.id;
        let probe_affiliation = normalize_affiliation(probe.entity.affiliation_text());

        // An empty probe affiliation zeroes that signal for every pair, so
        // no embedding is fetched at all in that case.
        let mut wanted: BTreeSet<String> = BTreeSet::new();
        if !probe_affiliation.is_empty() {
            wanted.insert(probe_affiliation.clone());
            for row in roster {
                if row.entity.id == probe_id || row.entity.kind != probe.entity.kind {
                    continue;
                }
                let affiliation = normalize_affiliation(row.entity.affiliation_text());
                if !affiliation.is_empty() {
                    wanted.insert(affiliation);
                }
            }
        }
        self.ensure_affiliation_vectors(&wanted, memo).await;

        let mut matches = Vec::new();
        for row in roster {
            if row.entity.id == probe_id || row.entity.kind != probe.entity.kind {
                continue;
            }

            let name_score = name_similarity(&probe.entity.name, &row.entity.name);

            let candidate_affiliation = normalize_affiliation(row.entity.affiliation_text());
            let affiliation_score = if probe_affiliation.is_empty()
                || candidate_affiliation.is_empty()
            {
                0.0
            } else {
                let (Some(probe_vector), Some(candidate_vector)) = (
                    memo.get(&probe_affiliation),
                    memo.get(&candidate_affiliation),
                ) else {
                    debug!(
                        probe = probe_id,
                        candidate = row.entity.id,
                        "pair skipped: affiliation vector unavailable"
                    );
                    continue;
                };
                match cosine_similarity(probe_vector, candidate_vector) {
                    Ok(similarity) => similarity,
                    Err(err) => {
                        warn!(
                            probe = probe_id,
                            candidate = row.entity.id,
                            error = %err,
                            "affiliation similarity failed; pair skipped"
                        );
                        continue;
                    }
                }
            };

            let domain_bonus = if shared_domain(&probe.entity, &row.entity) {
                self.weights.domain_bonus
            } else {
                0.0
            };
            let weighted = (self.weights.name * name_score
                + self.weights.affiliation * affiliation_score
                + domain_bonus)
                .min(1.0);

            if weighted >= threshold {
                matches.push(CandidateMatch {
                    entity_id: row.entity.id,
                    entity_name: row.entity.name.clone(),
                    weighted_score: weighted,
                    name_similarity: name_score,
                    affiliation_similarity: affiliation_score,
                    domain_bonus,
                });
            }
        }

        matches.sort_by(|a, b| {
            b.weighted_score
                .total_cmp(&a.weighted_score)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        matches
    }

    async fn ensure_affiliation_vectors(
        &self,
        texts: &BTreeSet<String>,
        memo: &mut HashMap<String, Vec<f32>>,
    ) {
        let missing: Vec<String> = texts
            .iter()
            .filter(|text| !memo.contains_key(*text))
            .cloned()
            .collect();
        if missing.is_empty() {
            return;
        }

        for chunk in missing.chunks(self.batch_size) {
            match self.embedding.embed_batch(chunk).await {
                Ok(vectors) => {
                    for (text, vector) in chunk.iter().zip(vectors) {
                        memo.insert(text.clone(), vector);
                    }
                }
                Err(err) => {
                    warn!(
                        inputs = chunk.len(),
                        error = %err,
                        "affiliation embedding batch failed; dependent pairs will be skipped"
                    );
                }
            }
        }
    }
}

/// Applies merge decisions against the repository: reads the duplicate's
/// attachments, builds a mutation plan, and hands it to the repository for
/// an atomic commit.
pub struct MergeExecutor {
    repo: Arc<dyn EntityRepository>,
}

impl MergeExecutor {
    pub fn new(repo: Arc<dyn EntityRepository>) -> Self {
        Self { repo }
    }

    /// Fold `duplicate_id` into `primary_id`. `Ok(true)` when the duplicate
    /// was absorbed and deleted; `Ok(false)` when the merge could not run
    /// (either id missing, self-merge, or the commit was rejected), leaving
    /// state untouched. `Err` is reserved for storage failures on reads.
    pub async fn merge_entities(&self, primary_id: i64, duplicate_id: i64) -> Result<bool> {
        if primary_id == duplicate_id {
            warn!(entity_id = primary_id, "refusing to merge an entity into itself");
            return Ok(false);
        }
        if self.repo.get_entity(primary_id).await?.is_none() {
            warn!(primary_id, duplicate_id, "merge skipped: primary no longer exists");
            return Ok(false);
        }
        if self.repo.get_entity(duplicate_id).await?.is_none() {
            warn!(primary_id, duplicate_id, "merge skipped: duplicate no longer exists");
            return Ok(false);
        }

        let duplicate_accounts = self.repo.accounts_owned_by(duplicate_id).await?;
        let primary_accounts = self.repo.accounts_owned_by(primary_id).await?;
        for account in &duplicate_accounts {
            let collides = primary_accounts.iter().any(|existing| {
                existing.platform == account.platform
                    && existing.handle_or_id == account.handle_or_id
            });
            if collides {
                warn!(
                    account_id = account.id,
                    platform = %account.platform,
                    handle = %account.handle_or_id,
                    "reassigned account repeats a (platform, handle) pair already on the primary"
                );
            }
        }

        let artifacts = self.repo.artifacts_authored_by(duplicate_id).await?;
        let mutation = MergeMutation {
            primary_id,
            duplicate_id,
            reassign_accounts: duplicate_accounts
                .iter()
                .map(|account| AccountReassignment {
                    account_id: account.id,
                    new_owner_id: primary_id,
                })
                .collect(),
            author_rewrites: artifacts
                .iter()
                .map(|artifact| AuthorRewrite {
                    artifact_id: artifact.id,
                    author_entity_ids: replace_author(
                        &artifact.author_entity_ids,
                        duplicate_id,
                        primary_id,
                    ),
                })
                .collect(),
        };
        let account_moves = mutation.reassign_accounts.len();
        let author_rewrites = mutation.author_rewrites.len();

        match self.repo.commit_merge(mutation).await {
            Ok(()) => {
                info!(
                    primary_id,
                    duplicate_id,
                    accounts = account_moves,
                    artifacts = author_rewrites,
                    "merged duplicate entity"
                );
                Ok(true)
            }
            Err(RepositoryError::EntityNotFound(missing)) => {
                warn!(
                    primary_id,
                    duplicate_id, missing, "merge aborted: entity vanished before commit"
                );
                Ok(false)
            }
            Err(err) => {
                warn!(
                    primary_id,
                    duplicate_id,
                    error = %err,
                    "merge transaction rejected; no changes applied"
                );
                Ok(false)
            }
        }
    }
}

/// Swap `duplicate_id` for `primary_id` in an author list, keeping the
/// earliest position and dropping any repeat that the swap would create.
fn replace_author(authors: &[i64], duplicate_id: i64, primary_id: i64) -> Vec<i64> {
    let mut rewritten = Vec::with_capacity(authors.len());
    for &author in authors {
        let mapped = if author == duplicate_id { primary_id } else { author };
        if !rewritten.contains(&mapped) {
            rewritten.push(mapped);
        }
    }
    rewritten
}

/// Pluggable reviewer for borderline pairs; production wires an LLM-backed
/// implementation. Without one, borderline pairs stay pending for human
/// review.
#[async_trait]
pub trait MergeAdjudicator: Send + Sync {
    async fn adjudicate(
        &self,
        primary: &EntityWithAccounts,
        candidate: &EntityWithAccounts,
        weighted_score: f64,
    ) -> Result<MergeDecision>;
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub similarity_threshold: f64,
    pub auto_merge_threshold: f64,
    pub weights: MatchWeights,
    pub batch_size: usize,
    pub reports_dir: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            auto_merge_threshold: DEFAULT_AUTO_MERGE_THRESHOLD,
            weights: MatchWeights::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            reports_dir: None,
        }
    }
}

impl ResolverConfig {
    /// Thresholds and report location from `RADAR_*` variables, with
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            similarity_threshold: env_f64("RADAR_SIMILARITY_THRESHOLD")
                .unwrap_or(defaults.similarity_threshold),
            auto_merge_threshold: env_f64("RADAR_AUTO_MERGE_THRESHOLD")
                .unwrap_or(defaults.auto_merge_threshold),
            weights: defaults.weights,
            batch_size: std::env::var("RADAR_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            reports_dir: std::env::var("RADAR_REPORTS_DIR").ok().map(PathBuf::from),
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Counters for one resolution sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolutionSummary {
    pub processed: usize,
    pub candidates_found: usize,
    pub merged: usize,
}

/// One scored pair as it looked when the decision was taken.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedPair {
    pub primary_entity_id: i64,
    pub primary_name: String,
    pub candidate_entity_id: i64,
    pub candidate_name: String,
    pub weighted_score: f64,
    pub name_similarity: f64,
    pub affiliation_similarity: f64,
    pub domain_bonus: f64,
}

/// Full record of one sweep, written under the reports directory when one
/// is configured.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub scope: EntityScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: ResolutionSummary,
    pub merged: Vec<ResolvedPair>,
    pub ignored: Vec<ResolvedPair>,
    pub pending_review: Vec<ResolvedPair>,
}

pub async fn write_run_report(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let path = run_dir.join("resolution_report.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing resolution report")?;
    fs::write(&path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Per-run sweep state. Deliberately not shared between runs: a duplicate
/// folded away in this sweep must not be merged again, but the next sweep
/// starts from a clean slate.
#[derive(Debug, Default)]
struct SweepState {
    visited: HashSet<i64>,
    consumed: HashSet<i64>,
    affiliation_vectors: HashMap<String, Vec<f32>>,
}

/// One-shot resolution sweep over the entity roster: scan, match, decide,
/// apply. Every pair failure is contained to that pair; completed merges
/// stay committed regardless of what happens later in the sweep.
pub struct ResolutionPipeline {
    repo: Arc<dyn EntityRepository>,
    audit: Arc<dyn MergeAuditLog>,
    matcher: CandidateMatcher,
    executor: MergeExecutor,
    adjudicator: Option<Arc<dyn MergeAdjudicator>>,
    config: ResolverConfig,
}

impl ResolutionPipeline {
    pub fn new(
        repo: Arc<dyn EntityRepository>,
        audit: Arc<dyn MergeAuditLog>,
        embedding: Arc<dyn EmbeddingService>,
        config: ResolverConfig,
    ) -> Self {
        let matcher = CandidateMatcher::new(embedding)
            .with_weights(config.weights)
            .with_batch_size(config.batch_size);
        let executor = MergeExecutor::new(Arc::clone(&repo));
        Self {
            repo,
            audit,
            matcher,
            executor,
            adjudicator: None,
            config,
        }
    }

    pub fn with_adjudicator(mut self, adjudicator: Arc<dyn MergeAdjudicator>) -> Self {
        self.adjudicator = Some(adjudicator);
        self
    }

    /// One full sweep over the scoped roster, returning only the counters.
    /// `run_with_report` keeps the per-pair detail.
    pub async fn run(&self, scope: EntityScope) -> Result<ResolutionSummary> {
        Ok(self.run_with_report(scope).await?.summary)
    }

    pub async fn run_with_report(&self, scope: EntityScope) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let roster = self
            .repo
            .list_all_entities(scope)
            .await
            .context("loading entity roster")?;
        info!(%run_id, roster = roster.len(), "identity resolution sweep started");

        let mut sweep = SweepState::default();
        let mut summary = ResolutionSummary {
            processed: 0,
            candidates_found: 0,
            merged: 0,
        };
        let mut merged_pairs = Vec::new();
        let mut ignored_pairs = Vec::new();
        let mut pending_pairs = Vec::new();

        for probe in &roster {
            let probe_id = probe.entity.id;
            if !sweep.visited.insert(probe_id) {
                continue;
            }
            if sweep.consumed.contains(&probe_id) {
                debug!(entity_id = probe_id, "skipping probe consumed earlier in this sweep");
                continue;
            }

            summary.processed += 1;
            let candidates = self
                .matcher
                .find_candidates_memoized(
                    probe,
                    &roster,
                    self.config.similarity_threshold,
                    &mut sweep.affiliation_vectors,
                )
                .await;

            for candidate in candidates {
                if sweep.consumed.contains(&candidate.entity_id) {
                    debug!(
                        probe = probe_id,
                        candidate = candidate.entity_id,
                        "candidate already folded into another entity this sweep"
                    );
                    continue;
                }
                summary.candidates_found += 1;

                if candidate.weighted_score >= self.config.auto_merge_threshold {
                    match self
                        .executor
                        .merge_entities(probe_id, candidate.entity_id)
                        .await
                    {
                        Ok(true) => {
                            sweep.consumed.insert(candidate.entity_id);
                            summary.merged += 1;
                            let note = format!(
                                "auto-merged at {:.3} (threshold {:.2})",
                                candidate.weighted_score, self.config.auto_merge_threshold
                            );
                            self.record_decision(
                                probe_id,
                                &candidate,
                                MergeDecision::Merge,
                                None,
                                Some(note),
                            )
                            .await;
                            merged_pairs.push(resolved_pair(probe, &candidate));
                        }
                        Ok(false) => {
                            warn!(
                                probe = probe_id,
                                candidate = candidate.entity_id,
                                "auto-merge did not apply; leaving pair for the next sweep"
                            );
                        }
                        Err(err) => {
                            warn!(
                                probe = probe_id,
                                candidate = candidate.entity_id,
                                error = %err,
                                "auto-merge errored; continuing sweep"
                            );
                        }
                    }
                    continue;
                }

                let Some(adjudicator) = self.adjudicator.as_deref() else {
                    debug!(
                        probe = probe_id,
                        candidate = candidate.entity_id,
                        score = candidate.weighted_score,
                        "borderline pair left pending for review"
                    );
                    pending_pairs.push(resolved_pair(probe, &candidate));
                    continue;
                };

                let Some(candidate_row) = roster
                    .iter()
                    .find(|row| row.entity.id == candidate.entity_id)
                else {
                    continue;
                };

                match adjudicator
                    .adjudicate(probe, candidate_row, candidate.weighted_score)
                    .await
                {
                    Ok(MergeDecision::Merge) => {
                        match self
                            .executor
                            .merge_entities(probe_id, candidate.entity_id)
                            .await
                        {
                            Ok(true) => {
                                sweep.consumed.insert(candidate.entity_id);
                                summary.merged += 1;
                                self.record_decision(
                                    probe_id,
                                    &candidate,
                                    MergeDecision::Merge,
                                    Some("adjudicator"),
                                    None,
                                )
                                .await;
                                merged_pairs.push(resolved_pair(probe, &candidate));
                            }
                            Ok(false) => {
                                warn!(
                                    probe = probe_id,
                                    candidate = candidate.entity_id,
                                    "adjudicated merge did not apply"
                                );
                            }
                            Err(err) => {
                                warn!(
                                    probe = probe_id,
                                    candidate = candidate.entity_id,
                                    error = %err,
                                    "adjudicated merge errored; continuing sweep"
                                );
                            }
                        }
                    }
                    Ok(MergeDecision::Ignore) => {
                        self.record_decision(
                            probe_id,
                            &candidate,
                            MergeDecision::Ignore,
                            Some("adjudicator"),
                            None,
                        )
                        .await;
                        ignored_pairs.push(resolved_pair(probe, &candidate));
                    }
                    Err(err) => {
                        warn!(
                            probe = probe_id,
                            candidate = candidate.entity_id,
                            error = %err,
                            "adjudication failed; pair skipped this sweep"
                        );
                    }
                }
            }
        }

        let finished_at = Utc::now();
        let report = RunReport {
            run_id,
            scope,
            started_at,
            finished_at,
            summary,
            merged: merged_pairs,
            ignored: ignored_pairs,
            pending_review: pending_pairs,
        };

        if let Some(reports_dir) = &self.config.reports_dir {
            let path = write_run_report(reports_dir, &report).await?;
            info!(%run_id, path = %path.display(), "resolution report written");
        }

        info!(
            %run_id,
            processed = report.summary.processed,
            candidates = report.summary.candidates_found,
            merged = report.summary.merged,
            "identity resolution sweep finished"
        );
        Ok(report)
    }

    async fn record_decision(
        &self,
        primary_id: i64,
        candidate: &CandidateMatch,
        decision: MergeDecision,
        reviewer: Option<&str>,
        notes: Option<String>,
    ) {
        let entry = NewMergeHistory {
            primary_entity_id: primary_id,
            candidate_entity_id: candidate.entity_id,
            decision,
            similarity_score: candidate.weighted_score,
            reviewer: reviewer.map(str::to_string),
            notes,
        };
        if let Err(err) = self.audit.record_merge_history(entry).await {
            warn!(
                primary_id,
                candidate = candidate.entity_id,
                error = %err,
                "failed to journal merge decision"
            );
        }
    }
}

fn resolved_pair(probe: &EntityWithAccounts, candidate: &CandidateMatch) -> ResolvedPair {
    ResolvedPair {
        primary_entity_id: probe.entity.id,
        primary_name: probe.entity.name.clone(),
        candidate_entity_id: candidate.entity_id,
        candidate_name: candidate.entity_name.clone(),
        weighted_score: candidate.weighted_score,
        name_similarity: candidate.name_similarity,
        affiliation_similarity: candidate.affiliation_similarity,
        domain_bonus: candidate.domain_bonus,
    }
}

/// Assemble a pipeline from env-derived config and run one sweep.
/// `similarity_threshold` and `batch_size` override the environment when
/// given.
pub async fn run_identity_resolution(
    repo: Arc<dyn EntityRepository>,
    audit: Arc<dyn MergeAuditLog>,
    embedding: Arc<dyn EmbeddingService>,
    scope: EntityScope,
    adjudicator: Option<Arc<dyn MergeAdjudicator>>,
    similarity_threshold: Option<f64>,
    batch_size: Option<usize>,
) -> Result<ResolutionSummary> {
    let mut config = ResolverConfig::from_env();
    if let Some(threshold) = similarity_threshold {
        config.similarity_threshold = threshold;
    }
    if let Some(batch) = batch_size {
        config.batch_size = batch;
    }

    let mut pipeline = ResolutionPipeline::new(repo, audit, embedding, config);
    if let Some(adjudicator) = adjudicator {
        pipeline = pipeline.with_adjudicator(adjudicator);
    }
    pipeline.run(scope).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use radar_core::{Account, Artifact, EntityKind};
    use radar_embedding::{FixtureEmbedder, HashingEmbedder};
    use radar_storage::InMemoryEntityRepository;
    use serde_json::json;

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

    fn mk_person(
        id: i64,
        name: &str,
        affiliation: Option<&str>,
        homepage: Option<&str>,
    ) -> EntityWithAccounts {
        let mut entity = mk_entity(id, EntityKind::Person, name);
        if let Some(affiliation) = affiliation {
            entity.metadata = json!({ "affiliation": affiliation });
        }
        entity.homepage_url = homepage.map(str::to_string);
        EntityWithAccounts::without_accounts(entity)
    }

    #[test]
    fn honorifics_and_spacing_are_normalized_away() {
        assert_eq!(normalize_name("Dr. John   Smith"), "john smith");
        assert_eq!(normalize_name("Prof Jane Doe"), "jane doe");
        assert_eq!(normalize_name("  Ms. Ada  Lovelace "), "ada lovelace");
        assert_eq!(normalize_name("Smith, John"), "smith, john");
        assert_eq!(normalize_name("Drake Ramoray"), "drake ramoray");
        assert_eq!(normalize_name("Dr."), "");
        assert_eq!(normalize_name(""), "");
    }

    #[test]
    fn name_similarity_matches_the_reference_pairs() {
        assert!(name_similarity("John Smith", "John Smith") > 0.95);
        assert!(name_similarity("John Smith", "Smith, John") > 0.85);
        assert!(name_similarity("J. Smith", "John Smith") > 0.70);
        assert!(name_similarity("John Smith", "Alice Wong") < 0.50);
    }

    #[test]
    fn name_similarity_is_symmetric() {
        let pairs = [
            ("John Smith", "Smith, John"),
            ("J. Smith", "John Smith"),
            ("Dr. Jane Doe", "Jane Doe"),
            ("Jon Smith", "John Smith"),
        ];
        for (a, b) in pairs {
            assert_eq!(name_similarity(a, b), name_similarity(b, a));
        }
    }

    #[test]
    fn shared_tokens_never_lower_the_score() {
        let shorter = name_similarity("J. Smith", "John Smith");
        let longer = name_similarity("J. Kevin Smith", "John Kevin Smith");
        assert!(longer >= shorter);
    }

    #[test]
    fn small_typos_stay_above_the_initials_bar() {
        assert!(name_similarity("Jon Smith", "John Smith") > 0.70);
    }

    #[test]
    fn empty_names_score_zero() {
        assert_eq!(name_similarity("", "John Smith"), 0.0);
        assert_eq!(name_similarity("Dr.", "Dr."), 0.0);
    }

    #[test]
    fn department_segments_are_stripped_from_affiliations() {
        assert_eq!(normalize_affiliation("MIT, Department of Physics"), "mit");
        assert_eq!(
            normalize_affiliation("Stanford University, School of Engineering, Dept. of CS"),
            "stanford university"
        );
        assert_eq!(normalize_affiliation("MIT, CSAIL Lab"), "mit");
    }

    #[test]
    fn campus_qualifiers_survive_affiliation_normalization() {
        assert_eq!(
            normalize_affiliation("University of California, Berkeley"),
            "university of california berkeley"
        );
        assert_eq!(normalize_affiliation("  MIT  "), "mit");
        assert_eq!(normalize_affiliation(""), "");
    }

    #[test]
    fn homepage_domains_drop_scheme_port_and_www() {
        assert_eq!(
            homepage_domain("https://www.csail.mit.edu/people/js"),
            Some("csail.mit.edu".to_string())
        );
        assert_eq!(homepage_domain("http://jsmith.ai"), Some("jsmith.ai".to_string()));
        assert_eq!(homepage_domain("jsmith.ai/home"), Some("jsmith.ai".to_string()));
        assert_eq!(
            homepage_domain("HTTPS://Example.COM:8080/profile"),
            Some("example.com".to_string())
        );
        assert_eq!(homepage_domain(""), None);
        assert_eq!(homepage_domain("not a url"), None);
    }

    #[test]
    fn author_rewrites_replace_in_place_and_drop_repeats() {
        assert_eq!(replace_author(&[2, 8], 2, 1), vec![1, 8]);
        assert_eq!(replace_author(&[1, 2, 8], 2, 1), vec![1, 8]);
        assert_eq!(replace_author(&[8, 2, 1], 2, 1), vec![8, 1]);
        assert_eq!(replace_author(&[3, 4], 2, 1), vec![3, 4]);
    }

    #[test]
    fn resolver_defaults_match_documented_thresholds() {
        let config = ResolverConfig::default();
        assert_eq!(config.similarity_threshold, 0.75);
        assert_eq!(config.auto_merge_threshold, 0.95);
        assert_eq!(config.batch_size, 32);
        assert!(config.reports_dir.is_none());
        assert_eq!(config.weights.name, 0.6);
        assert_eq!(config.weights.affiliation, 0.25);
        assert_eq!(config.weights.domain_bonus, 0.15);
    }

    #[tokio::test]
    async fn empty_affiliations_score_zero_without_an_embedding_call() {
        // The fixture has no vectors registered, so any embed call would
        // error; reaching 0.0 proves none was made.
        let embedding = FixtureEmbedder::new();
        let score = affiliation_similarity(&embedding, "", "MIT")
            .await
            .expect("no embedding needed");
        assert_eq!(score, 0.0);
        let score = affiliation_similarity(&embedding, "   ", "")
            .await
            .expect("no embedding needed");
        assert_eq!(score, 0.0);
    }

    #[tokio::test]
    async fn related_affiliations_score_by_cosine() {
        let embedding = FixtureEmbedder::new()
            .with_vector("mit", vec![1.0, 0.0])
            .with_vector("mit media lab", vec![0.8, 0.6]);
        let score = affiliation_similarity(&embedding, "MIT", "MIT Media Lab")
            .await
            .expect("pinned vectors");
        assert!((score - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn reordered_name_with_related_affiliation_is_a_candidate() {
        let embedding = Arc::new(
            FixtureEmbedder::new()
                .with_vector("ai researcher at mit", vec![1.0, 0.0])
                .with_vector("machine learning researcher", vec![0.75, 0.6614])
                .with_vector("biologist", vec![0.0, 1.0]),
        );
        let matcher = CandidateMatcher::new(embedding);

        let mut probe = mk_person(1, "John Smith", None, None);
        probe.entity.description = Some("AI researcher at MIT".to_string());
        let mut twin = mk_person(2, "Smith, John", None, None);
        twin.entity.description = Some("Machine learning researcher".to_string());
        let mut other = mk_person(3, "Alice Wong", None, None);
        other.entity.description = Some("Biologist".to_string());

        let roster = vec![probe.clone(), twin, other];
        let matches = matcher.find_candidate_matches(&probe, &roster, 0.75).await;

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entity_id, 2);
        assert!(matches[0].name_similarity > 0.85);
        assert!(matches[0].weighted_score >= 0.75);
    }

    #[tokio::test]
    async fn identical_names_with_unrelated_affiliations_stay_below_auto_merge() {
        let embedding = Arc::new(
            FixtureEmbedder::new()
                .with_vector("stanford", vec![1.0, 0.0])
                .with_vector("berkeley", vec![0.0, 1.0]),
        );
        let matcher = CandidateMatcher::new(embedding);

        let probe = mk_person(1, "David Chen", Some("Stanford"), None);
        let twin = mk_person(2, "David Chen", Some("Berkeley"), None);
        let roster = vec![probe.clone(), twin];

        let low_bar = matcher.find_candidate_matches(&probe, &roster, 0.5).await;
        assert_eq!(low_bar.len(), 1);
        assert!(low_bar[0].name_similarity > 0.99);
        assert!(low_bar[0].weighted_score < 0.90);

        let default_bar = matcher
            .find_candidate_matches(&probe, &roster, DEFAULT_SIMILARITY_THRESHOLD)
            .await;
        assert!(default_bar.is_empty());
    }

    #[tokio::test]
    async fn shared_homepage_domain_lifts_weak_name_matches() {
        let matcher = CandidateMatcher::new(Arc::new(HashingEmbedder::default()));

        let mut lab = mk_entity(10, EntityKind::Lab, "MIT CSAIL");
        lab.metadata = json!({ "affiliation": "MIT, CSAIL Lab" });
        lab.homepage_url = Some("https://csail.mit.edu".to_string());
        let mut lab_long = mk_entity(
            11,
            EntityKind::Lab,
            "MIT Computer Science and Artificial Intelligence Laboratory",
        );
        lab_long.metadata =
            json!({ "affiliation": "MIT, Computer Science and Artificial Intelligence Laboratory" });
        lab_long.homepage_url = Some("https://www.csail.mit.edu/about".to_string());

        let probe = EntityWithAccounts::without_accounts(lab);
        let linked = vec![
            probe.clone(),
            EntityWithAccounts::without_accounts(lab_long.clone()),
        ];
        let matches = matcher.find_candidate_matches(&probe, &linked, 0.40).await;
        assert_eq!(matches.len(), 1);
        assert!(matches[0].domain_bonus > 0.0);

        let mut lab_unlinked = lab_long;
        lab_unlinked.homepage_url = None;
        let unlinked = vec![
            probe.clone(),
            EntityWithAccounts::without_accounts(lab_unlinked),
        ];
        let matches = matcher.find_candidate_matches(&probe, &unlinked, 0.40).await;
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn candidates_exclude_probe_and_sort_by_score_then_id() {
        let matcher = CandidateMatcher::new(Arc::new(HashingEmbedder::default()));
        let probe = mk_person(1, "John Smith", Some("MIT"), Some("https://jsmith.ai"));
        let roster = vec![
            probe.clone(),
            mk_person(9, "Smith, J.", Some("MIT"), Some("https://jsmith.ai")),
            mk_person(2, "Smith, John", Some("MIT"), Some("https://jsmith.ai")),
            mk_person(5, "J. Smith", Some("MIT"), Some("https://jsmith.ai")),
        ];

        let matches = matcher.find_candidate_matches(&probe, &roster, 0.75).await;
        let ids: Vec<i64> = matches.iter().map(|m| m.entity_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert!(matches[0].weighted_score > matches[1].weighted_score);
        assert!((matches[1].weighted_score - matches[2].weighted_score).abs() < 1e-12);
    }

    #[tokio::test]
    async fn differing_kinds_are_never_paired() {
        let matcher = CandidateMatcher::new(Arc::new(HashingEmbedder::default()));
        let probe = mk_person(1, "Jordan Lee", Some("MIT"), Some("https://lee.dev"));
        let mut org = mk_entity(2, EntityKind::Organization, "Jordan Lee");
        org.metadata = json!({ "affiliation": "MIT" });
        org.homepage_url = Some("https://lee.dev".to_string());
        let roster = vec![probe.clone(), EntityWithAccounts::without_accounts(org)];

        let matches = matcher.find_candidate_matches(&probe, &roster, 0.1).await;
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn empty_and_singleton_rosters_yield_nothing() {
        let matcher = CandidateMatcher::new(Arc::new(HashingEmbedder::default()));
        let probe = mk_person(1, "John Smith", Some("MIT"), None);

        let matches = matcher.find_candidate_matches(&probe, &[], 0.1).await;
        assert!(matches.is_empty());

        let singleton = vec![probe.clone()];
        let matches = matcher.find_candidate_matches(&probe, &singleton, 0.1).await;
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn missing_affiliation_vector_skips_only_the_affected_pair() {
        let embedding = Arc::new(FixtureEmbedder::new().with_vector("mit", vec![1.0, 0.0]));
        let matcher = CandidateMatcher::new(embedding).with_batch_size(1);

        let probe = mk_person(1, "John Smith", Some("MIT"), Some("https://jsmith.ai"));
        let roster = vec![
            probe.clone(),
            mk_person(2, "Smith, John", Some("Stanford"), None),
            mk_person(3, "J. Smith", Some("MIT"), Some("https://jsmith.ai")),
        ];

        let matches = matcher.find_candidate_matches(&probe, &roster, 0.75).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entity_id, 3);
    }

    fn seeded_repo() -> Arc<InMemoryEntityRepository> {
        let repo = Arc::new(InMemoryEntityRepository::new());
        repo.insert_entity(mk_entity(1, EntityKind::Person, "John Smith"))
            .expect("seed");
        repo.insert_entity(mk_entity(2, EntityKind::Person, "Smith, John"))
            .expect("seed");
        repo.insert_account(Account {
            id: 3,
            entity_id: 2,
            platform: "github".to_string(),
            handle_or_id: "jsmith".to_string(),
            url: None,
            follower_count: None,
            raw_json: serde_json::Value::Null,
        })
        .expect("seed");
        repo.insert_artifact(Artifact {
            id: 7,
            title: "Sparse Retrieval at Scale".to_string(),
            url: None,
            author_entity_ids: vec![2, 8],
        })
        .expect("seed");
        repo
    }

    #[tokio::test]
    async fn merge_reassigns_accounts_rewrites_authors_and_deletes_duplicate() {
        let repo = seeded_repo();
        let executor = MergeExecutor::new(repo.clone());

        let merged = executor.merge_entities(1, 2).await.expect("merge runs");
        assert!(merged);
        assert_eq!(repo.account(3).expect("read").expect("account").entity_id, 1);
        assert_eq!(
            repo.artifact(7).expect("read").expect("artifact").author_entity_ids,
            vec![1, 8]
        );
        assert!(repo.get_entity(2).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn merge_with_missing_entity_is_a_noop_false() {
        let repo = seeded_repo();
        let executor = MergeExecutor::new(repo.clone());

        assert!(!executor.merge_entities(1, 9999).await.expect("completes"));
        assert!(!executor.merge_entities(9999, 2).await.expect("completes"));
        assert_eq!(repo.entity_count().expect("count"), 2);
        assert_eq!(repo.account(3).expect("read").expect("account").entity_id, 2);
    }

    #[tokio::test]
    async fn merge_succeeds_once_then_reports_false() {
        let repo = seeded_repo();
        let executor = MergeExecutor::new(repo.clone());

        assert!(executor.merge_entities(1, 2).await.expect("first merge"));
        assert!(!executor.merge_entities(1, 2).await.expect("second merge"));
        assert_eq!(repo.entity_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn self_merge_is_refused() {
        let repo = seeded_repo();
        let executor = MergeExecutor::new(repo.clone());

        assert!(!executor.merge_entities(1, 1).await.expect("completes"));
        assert_eq!(repo.entity_count().expect("count"), 2);
    }
}
