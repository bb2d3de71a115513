//! # Resolver Cache
//!
//! Process-wide TTL cache for the entity graph served to readers. All maps
//! live in one [`Generation`] behind a single reader/writer lock, so readers
//! never observe a partially written entry and invalidation is one exclusive
//! critical section.
//!
//! ## Core Design Principles
//!
//! 1.  **Per-read TTL check**: an entry is served only while
//!     `now - inserted_at < ttl`.
//!
//! 2.  **Generation sweep**: a background task replaces the whole generation
//!     once it is older than the TTL instead of expiring keys one by one.
//!     Staleness is therefore bounded by one TTL window.
//!
//! 3.  **Epoch-guarded fills**: every invalidation and sweep bumps an epoch.
//!     A loader records the epoch before it reads the system of record and
//!     its fill is discarded if the epoch moved meanwhile, so a load that
//!     raced an invalidation cannot re-insert the stale value.
//!
//! 4.  **Transitive population**: filling a projection (a board's assets, a
//!     project's boards) also fills the per-item entries it passed through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::entities::{Asset, Board, EntityKind, Project, User};

/// A cached value and when it was inserted.
#[derive(Debug)]
pub struct CacheEntry<T> {
    pub value: Arc<T>,
    pub inserted_at: Instant,
}

impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            inserted_at: self.inserted_at,
        }
    }
}

impl<T> CacheEntry<T> {
    fn new(value: Arc<T>, now: Instant) -> Self {
        Self { value, inserted_at: now }
    }

    fn fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) < ttl
    }
}

pub type AssetList = Vec<Arc<Asset>>;
pub type BoardList = Vec<Arc<Board>>;

struct Generation {
    started_at: Instant,
    epoch: u64,
    boards: HashMap<String, CacheEntry<Board>>,
    assets: HashMap<String, CacheEntry<Asset>>,
    users: HashMap<String, CacheEntry<User>>,
    projects: HashMap<String, CacheEntry<Project>>,
    board_assets: HashMap<String, CacheEntry<AssetList>>,
    project_boards: HashMap<String, CacheEntry<BoardList>>,
}

impl Generation {
    fn new(started_at: Instant, epoch: u64) -> Self {
        Self {
            started_at,
            epoch,
            boards: HashMap::new(),
            assets: HashMap::new(),
            users: HashMap::new(),
            projects: HashMap::new(),
            board_assets: HashMap::new(),
            project_boards: HashMap::new(),
        }
    }

    fn drop_asset(&mut self, id: &str, board_id: Option<&str>) {
        let parent = self.assets.remove(id).map(|entry| entry.value.board_id.clone());
        if parent.is_none() && board_id.is_none() {
            self.board_assets.clear();
            return;
        }
        self.board_assets.retain(|list_board, entry| {
            parent.as_deref() != Some(list_board.as_str())
                && board_id != Some(list_board.as_str())
                && !entry.value.iter().any(|asset| asset.id == id)
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub boards: usize,
    pub assets: usize,
    pub users: usize,
    pub projects: usize,
    pub board_assets: usize,
    pub project_boards: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub sweeps: u64,
    pub discarded_fills: u64,
    pub generation_age_ms: u64,
}

pub struct ResolverCache {
    ttl: Duration,
    state: RwLock<Generation>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    sweeps: AtomicU64,
    discarded_fills: AtomicU64,
}

fn lookup<T>(map: &HashMap<String, CacheEntry<T>>, id: &str, now: Instant, ttl: Duration) -> Option<Arc<T>> {
    map.get(id)
        .filter(|entry| entry.fresh(now, ttl))
        .map(|entry| Arc::clone(&entry.value))
}

impl ResolverCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(Generation::new(Instant::now(), 0)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            discarded_fills: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn read(&self) -> RwLockReadGuard<'_, Generation> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Generation> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn count<T>(&self, found: Option<T>) -> Option<T> {
        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Token a loader captures before reading the system of record.
    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Opens the write lock for a fill, or `None` if `epoch` is stale.
    fn fill(&self, epoch: u64, what: &str, id: &str) -> Option<RwLockWriteGuard<'_, Generation>> {
        let generation = self.write();
        if generation.epoch != epoch {
            self.discarded_fills.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(entity = what, id = %id, "discarding cache fill that raced an invalidation");
            return None;
        }
        Some(generation)
    }

    pub fn get_board(&self, id: &str) -> Option<Arc<Board>> {
        let found = lookup(&self.read().boards, id, Instant::now(), self.ttl);
        self.count(found)
    }

    pub fn set_board(&self, board: Board, epoch: u64) -> Arc<Board> {
        let board = Arc::new(board);
        if let Some(mut generation) = self.fill(epoch, "board", &board.id) {
            generation
                .boards
                .insert(board.id.clone(), CacheEntry::new(Arc::clone(&board), Instant::now()));
        }
        board
    }

    pub fn get_asset(&self, id: &str) -> Option<Arc<Asset>> {
        let found = lookup(&self.read().assets, id, Instant::now(), self.ttl);
        self.count(found)
    }

    pub fn set_assets(&self, assets: Vec<Asset>, epoch: u64) -> Vec<Arc<Asset>> {
        let assets: Vec<Arc<Asset>> = assets.into_iter().map(Arc::new).collect();
        if let Some(mut generation) = self.fill(epoch, "asset", "*") {
            let now = Instant::now();
            for asset in &assets {
                generation
                    .assets
                    .insert(asset.id.clone(), CacheEntry::new(Arc::clone(asset), now));
            }
        }
        assets
    }

    pub fn get_user(&self, id: &str) -> Option<Arc<User>> {
        let found = lookup(&self.read().users, id, Instant::now(), self.ttl);
        self.count(found)
    }

    pub fn set_users(&self, users: Vec<User>, epoch: u64) -> Vec<Arc<User>> {
        let users: Vec<Arc<User>> = users.into_iter().map(Arc::new).collect();
        if let Some(mut generation) = self.fill(epoch, "user", "*") {
            let now = Instant::now();
            for user in &users {
                generation
                    .users
                    .insert(user.id.clone(), CacheEntry::new(Arc::clone(user), now));
            }
        }
        users
    }

    pub fn get_project(&self, id: &str) -> Option<Arc<Project>> {
        let found = lookup(&self.read().projects, id, Instant::now(), self.ttl);
        self.count(found)
    }

    pub fn set_project(&self, project: Project, epoch: u64) -> Arc<Project> {
        let project = Arc::new(project);
        if let Some(mut generation) = self.fill(epoch, "project", &project.id) {
            generation
                .projects
                .insert(project.id.clone(), CacheEntry::new(Arc::clone(&project), Instant::now()));
        }
        project
    }

    pub fn get_board_assets(&self, board_id: &str) -> Option<Arc<AssetList>> {
        let found = lookup(&self.read().board_assets, board_id, Instant::now(), self.ttl);
        self.count(found)
    }

    /// Caches a board's asset list and every asset in it.
    pub fn set_board_assets(&self, board_id: &str, assets: Vec<Asset>, epoch: u64) -> Arc<AssetList> {
        let assets: Arc<AssetList> = Arc::new(assets.into_iter().map(Arc::new).collect());
        if let Some(mut generation) = self.fill(epoch, "board_assets", board_id) {
            let now = Instant::now();
            for asset in assets.iter() {
                generation
                    .assets
                    .insert(asset.id.clone(), CacheEntry::new(Arc::clone(asset), now));
            }
            generation
                .board_assets
                .insert(board_id.to_string(), CacheEntry::new(Arc::clone(&assets), now));
        }
        assets
    }

    pub fn get_project_boards(&self, project_id: &str) -> Option<Arc<BoardList>> {
        let found = lookup(&self.read().project_boards, project_id, Instant::now(), self.ttl);
        self.count(found)
    }

    /// Caches a project's board list and every board in it.
    pub fn set_project_boards(&self, project_id: &str, boards: Vec<Board>, epoch: u64) -> Arc<BoardList> {
        let boards: Arc<BoardList> = Arc::new(boards.into_iter().map(Arc::new).collect());
        if let Some(mut generation) = self.fill(epoch, "project_boards", project_id) {
            let now = Instant::now();
            for board in boards.iter() {
                generation
                    .boards
                    .insert(board.id.clone(), CacheEntry::new(Arc::clone(board), now));
            }
            generation
                .project_boards
                .insert(project_id.to_string(), CacheEntry::new(Arc::clone(&boards), now));
        }
        boards
    }

    /// # Invalidate
    ///
    /// - `Board`: the board, its asset-list projection and any project board
    ///   list that contains it.
    /// - `Asset`: see [`Self::invalidate_asset`]; the owning board is taken
    ///   from the cached asset when there is one.
    /// - `User`, `Project`: the entry itself; a project also drops its board
    ///   list.
    pub fn invalidate(&self, kind: EntityKind, id: &str) {
        let mut generation = self.write();
        generation.epoch += 1;

        match kind {
            EntityKind::Board => {
                generation.boards.remove(id);
                generation.board_assets.remove(id);
                generation
                    .project_boards
                    .retain(|_, entry| !entry.value.iter().any(|board| board.id == id));
            }
            EntityKind::Asset => generation.drop_asset(id, None),
            EntityKind::User => {
                generation.users.remove(id);
            }
            EntityKind::Project => {
                generation.projects.remove(id);
                generation.project_boards.remove(id);
            }
        }
        drop(generation);

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(kind = kind.as_str(), id = %id, "cache entry invalidated");
    }

    /// # Invalidate Asset
    ///
    /// Drops the asset, every board-asset list that contains it and the lists
    /// of its cached parent board and of `board_id`. Pass the owning board
    /// when it is known so a created or moved asset shows up on its board
    /// right away. When no owning board is known at all, every board-asset
    /// list is dropped.
    pub fn invalidate_asset(&self, id: &str, board_id: Option<&str>) {
        let mut generation = self.write();
        generation.epoch += 1;
        generation.drop_asset(id, board_id);
        drop(generation);

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(kind = EntityKind::Asset.as_str(), id = %id, board_id = ?board_id, "cache entry invalidated");
    }

    /// Drops the whole generation once it is older than the TTL. Returns
    /// whether a new generation was started.
    pub fn sweep(&self) -> bool {
        let now = Instant::now();
        let mut generation = self.write();
        if now.saturating_duration_since(generation.started_at) < self.ttl {
            return false;
        }
        let epoch = generation.epoch + 1;
        *generation = Generation::new(now, epoch);
        drop(generation);

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("resolver cache generation swept");
        true
    }

    /// Runs [`Self::sweep`] every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                }
            }
            tracing::debug!("resolver cache sweeper stopped");
        })
    }

    pub fn stats(&self) -> CacheStats {
        let generation = self.read();
        CacheStats {
            boards: generation.boards.len(),
            assets: generation.assets.len(),
            users: generation.users.len(),
            projects: generation.projects.len(),
            board_assets: generation.board_assets.len(),
            project_boards: generation.project_boards.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            discarded_fills: self.discarded_fills.load(Ordering::Relaxed),
            generation_age_ms: Instant::now().saturating_duration_since(generation.started_at).as_millis() as u64,
        }
    }
}
