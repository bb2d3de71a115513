use clap::Parser;
use lib_campaign::PipelineSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Campaign performance event pipeline server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "CAMPAIGN_PORT", help = "Port to listen on for API and live clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "CAMPAIGN_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "CAMPAIGN_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "CAMPAIGN_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "CAMPAIGN_BUS_URL", help = "Redis URL of the event bus. In-process bus when unset.")]
    pub bus_url: Option<String>,

    #[clap(long, env = "CAMPAIGN_SUBJECT_PREFIX", help = "Prefix of every bus subject.")]
    pub subject_prefix: Option<String>,

    #[clap(long, env = "CAMPAIGN_LANES", help = "Number of processing lanes campaigns are hashed onto.")]
    pub lane_count: Option<usize>,

    #[clap(long, env = "CAMPAIGN_PUBLISH_TIMEOUT_MS", help = "Deadline in milliseconds for publishing one update.")]
    pub publish_timeout_ms: Option<u64>,

    #[clap(long, env = "CAMPAIGN_CACHE_TTL_SECONDS", help = "Lifetime of resolver cache entries.")]
    pub cache_ttl_seconds: Option<u64>,

    #[clap(long, env = "CAMPAIGN_SIMULATOR", help = "Start the demo metrics simulator at boot (true/false).")]
    pub simulator_enabled: Option<bool>,

    #[clap(long, env = "CAMPAIGN_SIMULATOR_INTERVAL_SECONDS", help = "Seconds between simulated metric rounds.")]
    pub simulator_interval_seconds: Option<u64>,

    #[clap(long, env = "CAMPAIGN_HEALTH_INTERVAL_SECONDS", help = "Seconds between periodic health log lines.")]
    pub health_interval_seconds: Option<u64>,

    #[clap(long, env = "CAMPAIGN_SEED_ENTITIES", help = "Seed the entity store with a demo project (true/false).")]
    pub seed_entities: Option<bool>,

    /// Full pipeline settings; only read from the config file.
    #[clap(skip)]
    pub pipeline: Option<PipelineSettings>,
}

/// Resolved configuration handed to the rest of the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub bus_url: Option<String>,
    pub health_interval_seconds: u64,
    pub seed_entities: bool,
    pub pipeline: PipelineSettings,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            bus_url: other.bus_url.or(self.bus_url),
            subject_prefix: other.subject_prefix.or(self.subject_prefix),
            lane_count: other.lane_count.or(self.lane_count),
            publish_timeout_ms: other.publish_timeout_ms.or(self.publish_timeout_ms),
            cache_ttl_seconds: other.cache_ttl_seconds.or(self.cache_ttl_seconds),
            simulator_enabled: other.simulator_enabled.or(self.simulator_enabled),
            simulator_interval_seconds: other.simulator_interval_seconds.or(self.simulator_interval_seconds),
            health_interval_seconds: other.health_interval_seconds.or(self.health_interval_seconds),
            seed_entities: other.seed_entities.or(self.seed_entities),
            pipeline: other.pipeline.or(self.pipeline),
        }
    }

    fn resolve(self) -> ServerConfig {
        let mut pipeline = self.pipeline.unwrap_or_default();
        if let Some(prefix) = self.subject_prefix {
            pipeline.subject_prefix = prefix;
        }
        if let Some(lanes) = self.lane_count {
            pipeline.lane_count = lanes.max(1);
        }
        if let Some(timeout_ms) = self.publish_timeout_ms {
            pipeline.publish.timeout_ms = timeout_ms;
        }
        if let Some(ttl) = self.cache_ttl_seconds {
            pipeline.cache.ttl_seconds = ttl;
        }
        if let Some(enabled) = self.simulator_enabled {
            pipeline.simulator.enabled = enabled;
        }
        if let Some(interval) = self.simulator_interval_seconds {
            pipeline.simulator.interval_seconds = interval.max(1);
        }

        ServerConfig {
            port: self.port.unwrap_or(9010),
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            bus_url: self.bus_url.filter(|url| !url.trim().is_empty()),
            health_interval_seconds: self.health_interval_seconds.unwrap_or(60).max(1),
            seed_entities: self.seed_entities.unwrap_or(true),
            pipeline,
        }
    }
}

/// Layers defaults, the JSON config file and environment/CLI values.
///
/// Returns the resolved configuration plus notes about the config file that
/// are logged once logging is up.
pub fn load_config() -> (ServerConfig, Vec<String>) {
    load_config_from(Config::parse())
}

pub fn load_config_from(cli: Config) -> (ServerConfig, Vec<String>) {
    // 1. Load defaults
    let default_config = Config {
        port: Some(9010),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        health_interval_seconds: Some(60),
        ..Default::default()
    };

    // 2. Load from config file (server_campaign.conf) if present.
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_campaign.conf"));

    let mut notes = Vec::new();
    let mut current_config = default_config;

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => notes.push(format!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                )),
            },
            Err(e) => notes.push(format!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            )),
        }
    } else {
        notes.push(format!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        ));
    }

    // 3. Environment variables and CLI arguments win over the file.
    current_config = current_config.merge(cli);

    (current_config.resolve(), notes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(path: &std::path::Path, extra: &[&str]) -> Config {
        let mut args = vec!["server_campaign", "--config-path", path.to_str().unwrap()];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn file_values_override_defaults_and_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": 9200, "logLevel": "debug", "pipeline": {{"laneCount": 3, "subjectPrefix": "acme"}}}}"#
        )
        .unwrap();

        let (config, notes) = load_config_from(cli(file.path(), &["--port", "9300", "--lane-count", "5"]));
        assert!(notes.is_empty());
        assert_eq!(config.port, 9300);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.pipeline.lane_count, 5);
        assert_eq!(config.pipeline.subject_prefix, "acme");
        assert!(config.bus_url.is_none());
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let (config, notes) = load_config_from(cli(file.path(), &[]));
        assert_eq!(notes.len(), 1);
        assert_eq!(config.port, 9010);
        assert_eq!(config.pipeline, PipelineSettings::default());
    }
}
