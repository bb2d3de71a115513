//! # Resolver Cache & Batcher
//!
//! Read-side caching for the entity graph (projects, boards, assets, users)
//! that sits next to the campaign pipeline.
//!
//! - [`resolver_cache`]: the TTL cache, its generation sweep and
//!   invalidation rules.
//! - [`batcher`]: coalescing of identical in-flight loads.
//! - [`resolver`]: the cache-first read path tying both to an
//!   [`store::EntityStore`].

/// Coalescing of concurrent identical loads.
pub mod batcher;
/// Board, asset, user and project shapes.
pub mod entities;
/// Cache-first read path.
pub mod resolver;
/// TTL cache with generation sweep.
pub mod resolver_cache;
/// Per-operation timing statistics.
pub mod stats;
/// System-of-record seam.
pub mod store;

pub use entities::{Asset, AssetStatus, AssetType, Board, EntityKind, Project, ProjectStatus, User};
pub use resolver::{CachedResolver, ResolverStats};
pub use resolver_cache::{CacheEntry, CacheStats, ResolverCache};
pub use store::{EntityStore, InMemoryStore, StoreError};
