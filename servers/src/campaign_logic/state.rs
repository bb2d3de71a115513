use chrono::{Duration, Utc};
use lib_campaign::cache::{Asset, AssetStatus, AssetType, Board, Project, ProjectStatus, User};
use lib_campaign::{CachedResolver, CampaignPipeline, InMemoryStore};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shared handles for every request handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: CampaignPipeline,
    pub resolver: Arc<CachedResolver>,
    // Fires once on shutdown so live sockets close instead of holding the server open
    shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(pipeline: CampaignPipeline, resolver: Arc<CachedResolver>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            pipeline,
            resolver,
            shutdown_tx,
        }
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

/// Fills `store` with one owner, the given project, two boards and a handful
/// of assets so the read API has something to resolve without a database.
pub fn seed_demo_entities(store: &InMemoryStore, project_id: &str) {
    let now = Utc::now();
    let owner_id = "demo-owner".to_string();

    store.put_user(User {
        id: owner_id.clone(),
        email: "owner@example.com".to_string(),
        name: Some("Demo Owner".to_string()),
        avatar: None,
        created_at: now,
        updated_at: now,
    });
    store.put_project(Project {
        id: project_id.to_string(),
        name: "Demo project".to_string(),
        description: Some("Seeded at start-up".to_string()),
        status: ProjectStatus::Active,
        owner_id: owner_id.clone(),
        created_at: now,
        updated_at: now,
    });

    let boards = [("demo-board-summer", "Summer sale"), ("demo-board-launch", "Product launch")];
    for (offset, (board_id, name)) in boards.iter().enumerate() {
        let created = now - Duration::days(offset as i64);
        store.put_board(Board {
            id: board_id.to_string(),
            name: name.to_string(),
            description: None,
            project_id: project_id.to_string(),
            created_at: created,
            updated_at: created,
        });

        let kinds = [AssetType::Image, AssetType::Video, AssetType::Copy];
        for (index, asset_type) in kinds.into_iter().enumerate() {
            let created = created + Duration::minutes(index as i64);
            store.put_asset(Asset {
                id: format!("{}-asset-{}", board_id, index + 1),
                name: format!("{} asset {}", name, index + 1),
                asset_type,
                url: None,
                status: if index == 0 { AssetStatus::Approved } else { AssetStatus::Draft },
                board_id: board_id.to_string(),
                approved_by: (index == 0).then(|| owner_id.clone()),
                approved_at: (index == 0).then_some(created),
                created_at: created,
                updated_at: created,
            });
        }
    }
}
