//! # Entity Store
//!
//! The system-of-record seam behind the resolver cache. Production wires a
//! database-backed implementation; [`InMemoryStore`] serves the demo server
//! and the tests, and counts its loads so cache hits are observable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::entities::{Asset, Board, EntityKind, Project, User};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("{} '{id}' does not exist", .kind.as_str())]
    NotFound { kind: EntityKind, id: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// # Entity Store
///
/// Batch methods return only the ids that exist; missing ids are simply
/// absent from the result.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn board(&self, id: &str) -> Result<Board, StoreError>;
    /// A board's assets, newest first.
    async fn board_assets(&self, board_id: &str) -> Result<Vec<Asset>, StoreError>;
    async fn project(&self, id: &str) -> Result<Project, StoreError>;
    /// A project's boards, newest first.
    async fn project_boards(&self, project_id: &str) -> Result<Vec<Board>, StoreError>;
    async fn users(&self, ids: &[String]) -> Result<Vec<User>, StoreError>;
    async fn assets(&self, ids: &[String]) -> Result<Vec<Asset>, StoreError>;
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    projects: HashMap<String, Project>,
    boards: HashMap<String, Board>,
    assets: HashMap<String, Asset>,
}

/// In-process [`EntityStore`].
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    loads: AtomicU64,
    failing: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_user(&self, user: User) {
        self.write().users.insert(user.id.clone(), user);
    }

    pub fn put_project(&self, project: Project) {
        self.write().projects.insert(project.id.clone(), project);
    }

    pub fn put_board(&self, board: Board) {
        self.write().boards.insert(board.id.clone(), board);
    }

    pub fn put_asset(&self, asset: Asset) {
        self.write().assets.insert(asset.id.clone(), asset);
    }

    /// Backing loads served so far (one per trait call).
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Makes every subsequent load fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Adds an artificial delay to every load.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn begin_load(&self) -> Result<(), StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn board(&self, id: &str) -> Result<Board, StoreError> {
        self.begin_load().await?;
        self.read().boards.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            kind: EntityKind::Board,
            id: id.to_string(),
        })
    }

    async fn board_assets(&self, board_id: &str) -> Result<Vec<Asset>, StoreError> {
        self.begin_load().await?;
        let tables = self.read();
        if !tables.boards.contains_key(board_id) {
            return Err(StoreError::NotFound {
                kind: EntityKind::Board,
                id: board_id.to_string(),
            });
        }
        let mut assets: Vec<Asset> = tables
            .assets
            .values()
            .filter(|asset| asset.board_id == board_id)
            .cloned()
            .collect();
        assets.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(assets)
    }

    async fn project(&self, id: &str) -> Result<Project, StoreError> {
        self.begin_load().await?;
        self.read().projects.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            kind: EntityKind::Project,
            id: id.to_string(),
        })
    }

    async fn project_boards(&self, project_id: &str) -> Result<Vec<Board>, StoreError> {
        self.begin_load().await?;
        let mut boards: Vec<Board> = self
            .read()
            .boards
            .values()
            .filter(|board| board.project_id == project_id)
            .cloned()
            .collect();
        boards.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(boards)
    }

    async fn users(&self, ids: &[String]) -> Result<Vec<User>, StoreError> {
        self.begin_load().await?;
        let tables = self.read();
        Ok(ids.iter().filter_map(|id| tables.users.get(id).cloned()).collect())
    }

    async fn assets(&self, ids: &[String]) -> Result<Vec<Asset>, StoreError> {
        self.begin_load().await?;
        let tables = self.read();
        Ok(ids.iter().filter_map(|id| tables.assets.get(id).cloned()).collect())
    }
}
