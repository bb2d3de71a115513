//! # Cached Resolver
//!
//! The read path used by the query layer. Every lookup consults the
//! [`ResolverCache`] first; misses go through an [`InflightBatcher`] to the
//! [`EntityStore`], and the loader fills the cache before the in-flight slot
//! is released so the next reader hits the cache instead of the store.
//!
//! Store errors are returned as `CacheLoadFailed`; they are never turned into
//! an empty result or a cache miss.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::batcher::{BatcherStats, InflightBatcher};
use super::entities::{Asset, Board, EntityKind, Project, User};
use super::resolver_cache::{AssetList, BoardList, CacheStats, ResolverCache};
use super::stats::{OperationSnapshot, QueryStats};
use super::store::{EntityStore, StoreError};
use crate::configs::CacheSettings;
use crate::errors::PipelineResult;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverStats {
    pub cache: CacheStats,
    pub queries: BTreeMap<String, OperationSnapshot>,
    pub batchers: BTreeMap<&'static str, BatcherStats>,
}

pub struct CachedResolver {
    cache: Arc<ResolverCache>,
    store: Arc<dyn EntityStore>,
    settings: CacheSettings,
    users: InflightBatcher<User>,
    assets: InflightBatcher<Asset>,
    board_assets: InflightBatcher<AssetList>,
    stats: QueryStats,
}

impl CachedResolver {
    pub fn new(store: Arc<dyn EntityStore>, settings: CacheSettings) -> Self {
        Self {
            cache: Arc::new(ResolverCache::new(settings.ttl())),
            store,
            stats: QueryStats::new(std::time::Duration::from_millis(settings.slow_query_ms)),
            settings,
            users: InflightBatcher::new("users"),
            assets: InflightBatcher::new("assets"),
            board_assets: InflightBatcher::new("board_assets"),
        }
    }

    pub fn cache(&self) -> &Arc<ResolverCache> {
        &self.cache
    }

    /// Starts the generation sweeper on the configured interval.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.cache.spawn_sweeper(self.settings.sweep_interval(), cancel)
    }

    /// # Get Board Assets
    ///
    /// A board's assets, newest first. Loading the list also caches each
    /// asset individually.
    pub async fn get_board_assets(&self, board_id: &str) -> PipelineResult<Arc<AssetList>> {
        let result = self
            .stats
            .track("board_assets", async {
                if let Some(assets) = self.cache.get_board_assets(board_id) {
                    return Ok(assets);
                }

                let cache = Arc::clone(&self.cache);
                let store = Arc::clone(&self.store);
                let mut loaded = self
                    .board_assets
                    .load_many(&[board_id.to_string()], move |ids| async move {
                        let epoch = cache.epoch();
                        let mut out = Vec::with_capacity(ids.len());
                        for id in ids {
                            let assets = store.board_assets(&id).await?;
                            let list = cache.set_board_assets(&id, assets, epoch);
                            out.push((id, (*list).clone()));
                        }
                        Ok(out)
                    })
                    .await?;

                loaded
                    .remove(board_id)
                    .ok_or_else(|| StoreError::NotFound {
                        kind: EntityKind::Board,
                        id: board_id.to_string(),
                    })
            })
            .await?;
        Ok(result)
    }

    pub async fn get_board(&self, board_id: &str) -> PipelineResult<Arc<Board>> {
        let board = self
            .stats
            .track("board_load", async {
                if let Some(board) = self.cache.get_board(board_id) {
                    return Ok(board);
                }
                let epoch = self.cache.epoch();
                let board = self.store.board(board_id).await?;
                Ok::<_, StoreError>(self.cache.set_board(board, epoch))
            })
            .await?;
        Ok(board)
    }

    /// The board an asset belongs to.
    pub async fn get_asset_board(&self, asset_id: &str) -> PipelineResult<Arc<Board>> {
        let asset = self.get_asset(asset_id).await?;
        self.get_board(&asset.board_id).await
    }

    pub async fn get_asset(&self, asset_id: &str) -> PipelineResult<Arc<Asset>> {
        let mut assets = self.load_assets(&[asset_id.to_string()]).await?;
        assets.remove(asset_id).ok_or_else(|| {
            StoreError::NotFound {
                kind: EntityKind::Asset,
                id: asset_id.to_string(),
            }
            .into()
        })
    }

    /// Assets by id; unknown ids are absent from the result.
    pub async fn load_assets(&self, ids: &[String]) -> PipelineResult<HashMap<String, Arc<Asset>>> {
        let loaded = self
            .stats
            .track("asset_load", async {
                let (mut found, missing) = partition(ids, |id| self.cache.get_asset(id));
                if missing.is_empty() {
                    return Ok(found);
                }
                let cache = Arc::clone(&self.cache);
                let store = Arc::clone(&self.store);
                let fetched = self
                    .assets
                    .load_many(&missing, move |ids| async move {
                        let epoch = cache.epoch();
                        let assets = store.assets(&ids).await?;
                        Ok(cache
                            .set_assets(assets, epoch)
                            .into_iter()
                            .map(|asset| (asset.id.clone(), (*asset).clone()))
                            .collect())
                    })
                    .await?;
                found.extend(fetched);
                Ok::<_, StoreError>(found)
            })
            .await?;
        Ok(loaded)
    }

    pub async fn get_user(&self, user_id: &str) -> PipelineResult<Arc<User>> {
        let mut users = self.load_users(&[user_id.to_string()]).await?;
        users.remove(user_id).ok_or_else(|| {
            StoreError::NotFound {
                kind: EntityKind::User,
                id: user_id.to_string(),
            }
            .into()
        })
    }

    /// # Load Users
    ///
    /// Users by id, e.g. the authors of N sibling chat messages. Cached users
    /// are served directly, the rest are fetched in one coalesced batch.
    pub async fn load_users(&self, ids: &[String]) -> PipelineResult<HashMap<String, Arc<User>>> {
        let loaded = self
            .stats
            .track("user_load", async {
                let (mut found, missing) = partition(ids, |id| self.cache.get_user(id));
                if missing.is_empty() {
                    return Ok(found);
                }
                let cache = Arc::clone(&self.cache);
                let store = Arc::clone(&self.store);
                let fetched = self
                    .users
                    .load_many(&missing, move |ids| async move {
                        let epoch = cache.epoch();
                        let users = store.users(&ids).await?;
                        Ok(cache
                            .set_users(users, epoch)
                            .into_iter()
                            .map(|user| (user.id.clone(), (*user).clone()))
                            .collect())
                    })
                    .await?;
                found.extend(fetched);
                Ok::<_, StoreError>(found)
            })
            .await?;
        Ok(loaded)
    }

    pub async fn get_project(&self, project_id: &str) -> PipelineResult<Arc<Project>> {
        let project = self
            .stats
            .track("project_load", async {
                if let Some(project) = self.cache.get_project(project_id) {
                    return Ok(project);
                }
                let epoch = self.cache.epoch();
                let project = self.store.project(project_id).await?;
                Ok::<_, StoreError>(self.cache.set_project(project, epoch))
            })
            .await?;
        Ok(project)
    }

    /// A project's boards, newest first. Each board is cached individually.
    pub async fn get_project_boards(&self, project_id: &str) -> PipelineResult<Arc<BoardList>> {
        let boards = self
            .stats
            .track("project_boards", async {
                if let Some(boards) = self.cache.get_project_boards(project_id) {
                    return Ok(boards);
                }
                let epoch = self.cache.epoch();
                let boards = self.store.project_boards(project_id).await?;
                Ok::<_, StoreError>(self.cache.set_project_boards(project_id, boards, epoch))
            })
            .await?;
        Ok(boards)
    }

    /// Called by every mutation of the underlying entity.
    pub fn invalidate(&self, kind: EntityKind, id: &str) {
        self.cache.invalidate(kind, id);
    }

    /// Asset mutations that know the owning board (creation, moves) should
    /// call this instead of [`Self::invalidate`].
    pub fn invalidate_asset(&self, id: &str, board_id: Option<&str>) {
        self.cache.invalidate_asset(id, board_id);
    }

    pub fn stats(&self) -> ResolverStats {
        let mut batchers = BTreeMap::new();
        batchers.insert("users", self.users.stats());
        batchers.insert("assets", self.assets.stats());
        batchers.insert("board_assets", self.board_assets.stats());
        ResolverStats {
            cache: self.cache.stats(),
            queries: self.stats.snapshot(),
            batchers,
        }
    }
}

/// Splits `ids` into cache hits and the (deduplicated) misses.
fn partition<T>(
    ids: &[String],
    cached: impl Fn(&str) -> Option<Arc<T>>,
) -> (HashMap<String, Arc<T>>, Vec<String>) {
    let mut found = HashMap::new();
    let mut missing = Vec::new();
    for id in ids {
        if found.contains_key(id) || missing.contains(id) {
            continue;
        }
        match cached(id) {
            Some(value) => {
                found.insert(id.clone(), value);
            }
            None => missing.push(id.clone()),
        }
    }
    (found, missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entities::{AssetStatus, AssetType, ProjectStatus};
    use crate::cache::store::InMemoryStore;
    use crate::errors::PipelineError;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn seeded() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        store.put_project(Project {
            id: "p1".into(),
            name: "Launch".into(),
            description: None,
            status: ProjectStatus::Active,
            owner_id: "u1".into(),
            created_at: now,
            updated_at: now,
        });
        for (index, board_id) in ["b1", "b2"].iter().enumerate() {
            store.put_board(Board {
                id: board_id.to_string(),
                name: board_id.to_uppercase(),
                description: None,
                project_id: "p1".into(),
                created_at: now + ChronoDuration::seconds(index as i64),
                updated_at: now,
            });
        }
        for (index, asset_id) in ["a1", "a2", "a3"].iter().enumerate() {
            store.put_asset(Asset {
                id: asset_id.to_string(),
                name: asset_id.to_string(),
                asset_type: AssetType::Video,
                url: None,
                status: AssetStatus::Draft,
                board_id: if index < 2 { "b1".into() } else { "b2".into() },
                approved_by: None,
                approved_at: None,
                created_at: now + ChronoDuration::seconds(index as i64),
                updated_at: now,
            });
        }
        for user_id in ["u1", "u2", "u3"] {
            store.put_user(User {
                id: user_id.into(),
                email: format!("{}@example.com", user_id),
                name: None,
                avatar: None,
                created_at: now,
                updated_at: now,
            });
        }
        store
    }

    fn resolver(store: &Arc<InMemoryStore>) -> CachedResolver {
        CachedResolver::new(store.clone(), CacheSettings::default())
    }

    #[tokio::test]
    async fn board_assets_twice_within_ttl_loads_once() {
        let store = seeded();
        let resolver = resolver(&store);

        let first = resolver.get_board_assets("b1").await.unwrap();
        let second = resolver.get_board_assets("b1").await.unwrap();

        assert_eq!(first, second);
        let ids: Vec<&str> = first.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a1"]);
        assert_eq!(store.loads(), 1);
    }

    #[tokio::test]
    async fn board_assets_population_is_transitive() {
        let store = seeded();
        let resolver = resolver(&store);

        resolver.get_board_assets("b1").await.unwrap();
        let asset = resolver.get_asset("a1").await.unwrap();
        assert_eq!(asset.board_id, "b1");
        assert_eq!(store.loads(), 1);
    }

    #[tokio::test]
    async fn board_invalidation_forces_a_reload() {
        let store = seeded();
        let resolver = resolver(&store);

        resolver.get_board_assets("b1").await.unwrap();
        resolver.invalidate(EntityKind::Board, "b1");
        resolver.get_board_assets("b1").await.unwrap();
        assert_eq!(store.loads(), 2);
    }

    #[tokio::test]
    async fn asset_invalidation_leaves_unrelated_entries() {
        let store = seeded();
        let resolver = resolver(&store);

        resolver.get_board_assets("b1").await.unwrap();
        resolver.get_board_assets("b2").await.unwrap();
        resolver.invalidate(EntityKind::Asset, "a3");

        resolver.get_board_assets("b1").await.unwrap();
        assert_eq!(store.loads(), 2);
        resolver.get_board_assets("b2").await.unwrap();
        assert_eq!(store.loads(), 3);
    }

    fn new_asset(id: &str, board_id: &str) -> Asset {
        let now = Utc::now() + ChronoDuration::seconds(60);
        Asset {
            id: id.into(),
            name: id.into(),
            asset_type: AssetType::Image,
            url: None,
            status: AssetStatus::Draft,
            board_id: board_id.into(),
            approved_by: None,
            approved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn created_asset_appears_after_invalidation() {
        let store = seeded();
        let resolver = resolver(&store);
        assert_eq!(resolver.get_board_assets("b1").await.unwrap().len(), 2);

        store.put_asset(new_asset("a4", "b1"));
        resolver.invalidate(EntityKind::Asset, "a4");

        let assets = resolver.get_board_assets("b1").await.unwrap();
        assert_eq!(assets.len(), 3);
        assert_eq!(assets[0].id, "a4");
    }

    #[tokio::test]
    async fn asset_invalidation_with_its_board_keeps_other_lists() {
        let store = seeded();
        let resolver = resolver(&store);
        resolver.get_board_assets("b1").await.unwrap();
        resolver.get_board_assets("b2").await.unwrap();

        store.put_asset(new_asset("a4", "b2"));
        resolver.invalidate_asset("a4", Some("b2"));

        assert_eq!(resolver.get_board_assets("b2").await.unwrap().len(), 2);
        assert_eq!(store.loads(), 3);
        resolver.get_board_assets("b1").await.unwrap();
        assert_eq!(store.loads(), 3);
    }

    #[tokio::test]
    async fn concurrent_user_loads_issue_one_backing_call() {
        let store = seeded();
        store.set_latency(Some(Duration::from_millis(20)));
        let resolver = Arc::new(resolver(&store));
        let ids: Vec<String> = vec!["u1".into(), "u2".into(), "u3".into(), "u1".into()];

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let resolver = Arc::clone(&resolver);
            let ids = ids.clone();
            tasks.push(tokio::spawn(async move { resolver.load_users(&ids).await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().len(), 3);
        }
        assert_eq!(store.loads(), 1);

        resolver.get_user("u2").await.unwrap();
        assert_eq!(store.loads(), 1);
    }

    #[tokio::test]
    async fn project_boards_cache_each_board() {
        let store = seeded();
        let resolver = resolver(&store);

        let boards = resolver.get_project_boards("p1").await.unwrap();
        assert_eq!(boards.len(), 2);
        assert_eq!(boards[0].id, "b2");
        resolver.get_board("b1").await.unwrap();
        assert_eq!(store.loads(), 1);
    }

    #[tokio::test]
    async fn store_errors_are_not_masked() {
        let store = seeded();
        let resolver = resolver(&store);
        store.set_failing(true);

        let err = resolver.get_board_assets("b1").await.unwrap_err();
        assert!(matches!(err, PipelineError::CacheLoadFailed(StoreError::Backend(_))));
        assert!(resolver.cache().get_board_assets("b1").is_none());

        store.set_failing(false);
        let missing = resolver.get_board("nope").await.unwrap_err();
        assert!(matches!(missing, PipelineError::CacheLoadFailed(StoreError::NotFound { .. })));

        let stats = resolver.stats();
        assert_eq!(stats.queries["board_assets"].errors, 1);
        assert_eq!(stats.queries["board_load"].errors, 1);
    }
}
