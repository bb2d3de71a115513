// Campaign performance event pipeline.

// Declare the modules to re-export
pub mod bus;
pub mod cache;
pub mod configs;
#[cfg(feature = "connections")]
pub mod connections; // Bus broker transports
pub mod errors;
pub mod models;
pub mod pipeline; // Registry, calculator, alerting, lanes, simulator

// Re-export the public surface
pub use bus::{
    BusError, BusMessage, BusStream, CampaignEvent, EventBus, EventKind, EventPublisher, InMemoryBus, Subscription,
    SubscriptionBridge,
};
pub use cache::{CachedResolver, EntityKind, EntityStore, InMemoryStore, StoreError};
pub use configs::PipelineSettings;
#[cfg(feature = "connections")]
pub use connections::RedisBus;
pub use errors::{PipelineError, PipelineResult};
pub use models::*;
pub use pipeline::{CampaignPipeline, HealthReport, HealthStatus, Registered, UpdateOutcome};
