//! # Configs Module
//!
//! Library-side settings for the campaign pipeline. Binaries layer their own
//! sources (files, environment, CLI) on top and hand the resolved
//! [`PipelineSettings`] to [`crate::pipeline::CampaignPipeline::start`].

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Pipeline, publisher, bridge, cache and simulator settings.
pub mod settings;

pub use settings::{
    CacheSettings, PipelineSettings, ReconnectSettings, RetrySettings, SeverityBand,
    SeverityPolicy, SimulatorSettings,
};
