//! Concurrent workload simulation.
//!
//! Drives posts and their comments through the cache from several blocking
//! workers, with an in-memory table set standing in for the database. Each
//! transaction is one of: read a post, read a post's comments, run the title
//! query, update a post title, add a comment. Reads compare what the cache
//! served with what the source held when the read began, so the report shows
//! how many stale reads a strategy let through.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{
    CacheEntry, CacheError, CollectionCoordinator, ParamValue, RegionHandle,
    RegionStatistics, SecondLevelCache, StrategyKind, TransactionWrites, TxId, Version,
    collection_region_name, entity_key, mutex_lock, query_key,
};
use crate::error::AppError;
use crate::infra::error::InfraError;

pub const POST_ENTITY: &str = "Post";
pub const COMMENTS_ROLE: &str = "comments";
pub const POST_TABLE: &str = "post";
pub const COMMENT_TABLE: &str = "post_comment";
const TITLE_PREFIX: &str = "High-Performance Java Persistence";
const TITLE_QUERY: &str = "select p.id from Post p where p.title like :prefix";
const LOCK_OWNER: &str = "workload::source";

/// Entity state as stored in the `Post` region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostState {
    pub title: String,
}

#[derive(Debug, Clone)]
struct PostRow {
    title: String,
    version: Version,
    comments: Vec<i64>,
}

#[derive(Debug, Default)]
struct SourceState {
    posts: BTreeMap<i64, PostRow>,
    next_comment_id: i64,
}

/// In-memory source of truth with optimistic versioning on posts.
#[derive(Debug, Default)]
pub struct InMemorySource {
    state: Mutex<SourceState>,
}

impl InMemorySource {
    /// `posts` posts with two comments each.
    pub fn seeded(posts: usize) -> Self {
        let mut state = SourceState::default();
        for id in 1..=posts as i64 {
            let comments = vec![state.next_comment_id + 1, state.next_comment_id + 2];
            state.next_comment_id += 2;
            state.posts.insert(
                id,
                PostRow {
                    title: format!("{TITLE_PREFIX}, part {id}"),
                    version: Version(1),
                    comments,
                },
            );
        }
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn post(&self, id: i64) -> Option<(Version, PostState)> {
        let state = mutex_lock(&self.state, LOCK_OWNER, "post");
        state.posts.get(&id).map(|row| {
            (
                row.version,
                PostState {
                    title: row.title.clone(),
                },
            )
        })
    }

    pub fn post_version(&self, id: i64) -> Option<Version> {
        mutex_lock(&self.state, LOCK_OWNER, "post_version")
            .posts
            .get(&id)
            .map(|row| row.version)
    }

    pub fn comments(&self, post_id: i64) -> Option<Vec<i64>> {
        mutex_lock(&self.state, LOCK_OWNER, "comments")
            .posts
            .get(&post_id)
            .map(|row| row.comments.clone())
    }

    pub fn post_ids(&self) -> Vec<i64> {
        mutex_lock(&self.state, LOCK_OWNER, "post_ids")
            .posts
            .keys()
            .copied()
            .collect()
    }

    /// Write a new title if the row is still at `expected`. Returns the new version.
    pub fn update_post(&self, id: i64, expected: Version, title: String) -> Option<Version> {
        let mut state = mutex_lock(&self.state, LOCK_OWNER, "update_post");
        let row = state.posts.get_mut(&id)?;
        if row.version != expected {
            return None;
        }
        row.version = expected.next();
        row.title = title;
        Some(row.version)
    }

    pub fn add_comment(&self, post_id: i64) -> Option<i64> {
        let mut state = mutex_lock(&self.state, LOCK_OWNER, "add_comment");
        if !state.posts.contains_key(&post_id) {
            return None;
        }
        state.next_comment_id += 1;
        let comment_id = state.next_comment_id;
        state.posts.get_mut(&post_id)?.comments.push(comment_id);
        Some(comment_id)
    }
}

#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub transactions: usize,
    pub workers: usize,
    pub posts: usize,
    pub failure_rate: f64,
}

impl SimulationParams {
    fn validate(&self) -> Result<(), AppError> {
        if self.workers == 0 {
            return Err(AppError::validation("workers must be greater than zero"));
        }
        if self.posts == 0 {
            return Err(AppError::validation("posts must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(AppError::validation("failure rate must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Tally {
    pub post_reads: u64,
    pub post_hits: u64,
    pub stale_post_reads: u64,
    pub comment_reads: u64,
    pub comment_hits: u64,
    pub stale_comment_reads: u64,
    pub queries: u64,
    pub query_hits: u64,
    pub writes_committed: u64,
    pub writes_rolled_back: u64,
    pub lock_conflicts: u64,
    pub stale_writes: u64,
    pub errors: u64,
}

impl Tally {
    fn merge(&mut self, other: &Tally) {
        self.post_reads += other.post_reads;
        self.post_hits += other.post_hits;
        self.stale_post_reads += other.stale_post_reads;
        self.comment_reads += other.comment_reads;
        self.comment_hits += other.comment_hits;
        self.stale_comment_reads += other.stale_comment_reads;
        self.queries += other.queries;
        self.query_hits += other.query_hits;
        self.writes_committed += other.writes_committed;
        self.writes_rolled_back += other.writes_rolled_back;
        self.lock_conflicts += other.lock_conflicts;
        self.stale_writes += other.stale_writes;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub strategy: StrategyKind,
    pub collection_strategy: StrategyKind,
    pub transactions: usize,
    pub workers: usize,
    pub elapsed_ms: u128,
    pub tally: Tally,
    /// Cached posts whose version differs from the source after the run.
    pub divergent_entries: usize,
    pub regions: Vec<RegionStatistics>,
}

#[derive(Clone)]
struct Workload {
    cache: Arc<SecondLevelCache>,
    source: Arc<InMemorySource>,
    posts: RegionHandle,
    comments: CollectionCoordinator,
    post_count: u64,
    failure_rate: f64,
}

enum Action {
    ReadPost,
    ReadComments,
    Query,
    UpdatePost,
    AddComment,
}

/// SplitMix64; deterministic per transaction index.
fn mix(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

impl Workload {
    fn plan(&self, index: usize) -> (Action, i64, bool) {
        let roll = mix(index as u64);
        let action = match roll % 100 {
            0..=54 => Action::ReadPost,
            55..=69 => Action::ReadComments,
            70..=79 => Action::Query,
            80..=92 => Action::UpdatePost,
            _ => Action::AddComment,
        };
        let post_id = ((roll >> 8) % self.post_count) as i64 + 1;
        let fail = ((roll >> 32) % 10_000) as f64 / 10_000.0 < self.failure_rate;
        (action, post_id, fail)
    }

    fn run(&self, index: usize, tally: &mut Tally) {
        let (action, post_id, fail) = self.plan(index);
        let result = match action {
            Action::ReadPost => self.read_post(post_id, tally),
            Action::ReadComments => self.read_comments(post_id, tally),
            Action::Query => self.query_titles(tally),
            Action::UpdatePost => self.update_post(post_id, fail, tally),
            Action::AddComment => self.add_comment(post_id, fail, tally),
        };
        if let Err(err) = result {
            tally.errors += 1;
            warn!(index, post_id, error = %err, "Simulated transaction failed");
        }
    }

    fn read_post(&self, id: i64, tally: &mut Tally) -> Result<(), CacheError> {
        tally.post_reads += 1;
        let key = entity_key(POST_ENTITY, id);
        let committed = self.source.post_version(id).unwrap_or(Version::INITIAL);

        if let Some(entry) = self.posts.get(&key) {
            tally.post_hits += 1;
            entry.decode::<PostState>()?;
            if entry.version() < committed {
                tally.stale_post_reads += 1;
            }
            return Ok(());
        }

        if let Some((version, state)) = self.source.post(id) {
            self.posts
                .after_load(&key, CacheEntry::encode(version, &state)?)?;
        }
        Ok(())
    }

    fn read_comments(&self, id: i64, tally: &mut Tally) -> Result<(), CacheError> {
        tally.comment_reads += 1;
        let committed = self.source.comments(id).map_or(0, |ids| ids.len());

        if let Some(ids) = self.comments.get(id) {
            tally.comment_hits += 1;
            if ids.len() < committed {
                tally.stale_comment_reads += 1;
            }
            return Ok(());
        }

        if let Some(ids) = self.source.comments(id) {
            let version = Version(ids.len() as u64);
            self.comments.after_load(id, version, ids)?;
        }
        Ok(())
    }

    fn query_titles(&self, tally: &mut Tally) -> Result<(), CacheError> {
        tally.queries += 1;
        let key = query_key(TITLE_QUERY, [ParamValue::from(format!("{TITLE_PREFIX}%"))]);
        if self.cache.query_get(&key).is_some() {
            tally.query_hits += 1;
            return Ok(());
        }
        // Stamp before reading so a concurrent commit invalidates the result.
        let created_at = self.cache.now();
        let ids = self.source.post_ids();
        self.cache.query_put(&key, ids, &[POST_TABLE], created_at)?;
        Ok(())
    }

    fn update_post(&self, id: i64, fail: bool, tally: &mut Tally) -> Result<(), CacheError> {
        let Some((current, _)) = self.source.post(id) else {
            return Ok(());
        };
        let next = current.next();
        let state = PostState {
            title: format!("{TITLE_PREFIX}, part {id} (rev {})", next.0),
        };

        let mut writes = TransactionWrites::new(TxId::new());
        match writes.update_entity(
            &self.posts,
            entity_key(POST_ENTITY, id),
            CacheEntry::encode(next, &state)?,
        ) {
            Ok(()) => {}
            Err(err) if err.is_recoverable() => {
                tally.lock_conflicts += 1;
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        writes.touch_table(POST_TABLE);

        let success = !fail && self.source.update_post(id, current, state.title).is_some();
        self.finish(writes, success, tally);
        Ok(())
    }

    fn add_comment(&self, id: i64, fail: bool, tally: &mut Tally) -> Result<(), CacheError> {
        let mut writes = TransactionWrites::new(TxId::new());
        match writes.mutate_collection(&self.comments, id) {
            Ok(()) => {}
            Err(err) if err.is_recoverable() => {
                tally.lock_conflicts += 1;
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        writes.touch_table(COMMENT_TABLE);

        let success = !fail && self.source.add_comment(id).is_some();
        self.finish(writes, success, tally);
        Ok(())
    }

    fn finish(&self, writes: TransactionWrites, success: bool, tally: &mut Tally) {
        let report = writes.complete(&self.cache, success);
        tally.stale_writes += report.errors.len() as u64;
        if success {
            tally.writes_committed += 1;
        } else {
            tally.writes_rolled_back += 1;
        }
    }

    fn divergent_entries(&self) -> usize {
        self.source
            .post_ids()
            .into_iter()
            .filter(|id| {
                let cached = self.posts.get(&entity_key(POST_ENTITY, *id));
                match (cached, self.source.post_version(*id)) {
                    (Some(entry), Some(version)) => entry.version() != version,
                    _ => false,
                }
            })
            .count()
    }
}

/// Register the `Post` and `Post.comments` regions using the cache's
/// configured default strategy (subject to per-region overrides).
pub fn register_regions(
    cache: &SecondLevelCache,
) -> Result<(RegionHandle, CollectionCoordinator), CacheError> {
    let config = cache.config();
    let posts = cache.register_entity(POST_ENTITY, config.strategy_or_default(POST_ENTITY))?;
    let comments = cache.register_collection(
        POST_ENTITY,
        COMMENTS_ROLE,
        config.strategy_or_default(&collection_region_name(POST_ENTITY, COMMENTS_ROLE)),
    )?;
    Ok((posts, comments))
}

/// Run `params.transactions` transactions over `params.workers` blocking tasks.
pub async fn simulate(
    cache: Arc<SecondLevelCache>,
    params: SimulationParams,
) -> Result<SimulationReport, AppError> {
    params.validate()?;
    let (posts, comments) = register_regions(&cache)?;
    let workload = Workload {
        cache: Arc::clone(&cache),
        source: Arc::new(InMemorySource::seeded(params.posts)),
        posts,
        comments,
        post_count: params.posts as u64,
        failure_rate: params.failure_rate,
    };

    info!(
        transactions = params.transactions,
        workers = params.workers,
        strategy = %workload.posts.strategy(),
        "Starting simulation"
    );
    let started = Instant::now();

    let handles: Vec<_> = (0..params.workers)
        .map(|worker| {
            let workload = workload.clone();
            let transactions = params.transactions;
            let workers = params.workers;
            tokio::task::spawn_blocking(move || {
                let mut tally = Tally::default();
                for index in (worker..transactions).step_by(workers) {
                    workload.run(index, &mut tally);
                }
                tally
            })
        })
        .collect();

    let mut tally = Tally::default();
    for handle in handles {
        let worker_tally = handle
            .await
            .map_err(|err| InfraError::worker(err.to_string()))?;
        tally.merge(&worker_tally);
    }

    let report = SimulationReport {
        strategy: workload.posts.strategy(),
        collection_strategy: workload.comments.strategy(),
        transactions: params.transactions,
        workers: params.workers,
        elapsed_ms: started.elapsed().as_millis(),
        divergent_entries: workload.divergent_entries(),
        tally,
        regions: cache.statistics(),
    };
    info!(
        elapsed_ms = report.elapsed_ms as u64,
        stale_post_reads = report.tally.stale_post_reads,
        divergent_entries = report.divergent_entries,
        "Simulation finished"
    );
    Ok(report)
}
