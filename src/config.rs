use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::infer::{InferConfig, DEFAULT_POOL_SIZE, DEFAULT_QUEUE_DEPTH};
use crate::muxer::MuxerConfig;
use crate::selector::{SelectorConfig, DEFAULT_MAX_QUEUE_SIZE};

const DEFAULT_CHANNELS: u32 = 4;
const DEFAULT_STAGE_IN_ID: u32 = 1;
const DEFAULT_STAGE_OUT_ID: u32 = 1;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    channels: Option<u32>,
    selector: Option<SelectorConfigFile>,
    muxer: Option<MuxerConfigFile>,
    infer: Option<InferConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SelectorConfigFile {
    max_queue_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct MuxerConfigFile {
    live_source: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct InferConfigFile {
    stage_in_id: Option<u32>,
    stage_out_id: Option<u32>,
    secondary_mode: Option<bool>,
    queue_depth: Option<usize>,
    pool_size: Option<usize>,
}

/// Resolved pipeline configuration: TOML file, then environment overrides,
/// then validation.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub channels: u32,
    pub selector: SelectorConfig,
    pub muxer: MuxerConfig,
    pub infer: InferConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS,
            selector: SelectorConfig::default(),
            muxer: MuxerConfig::default(),
            infer: InferConfig {
                stage_in_id: DEFAULT_STAGE_IN_ID,
                stage_out_id: DEFAULT_STAGE_OUT_ID,
                ..Default::default()
            },
        }
    }
}

impl PipelineConfig {
    /// Load from the file named by `FRAMEMUX_CONFIG` (if set), apply env
    /// overrides, validate.
    pub fn load() -> Result<Self> {
        let file_cfg = match std::env::var("FRAMEMUX_CONFIG").ok().as_deref() {
            Some(path) if !path.trim().is_empty() => read_config_file(Path::new(path))?,
            _ => PipelineConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file path, then env overrides and validation.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let selector = SelectorConfig {
            max_queue_size: file
                .selector
                .as_ref()
                .and_then(|s| s.max_queue_size)
                .unwrap_or(DEFAULT_MAX_QUEUE_SIZE),
        };
        let muxer = MuxerConfig {
            live_source: file
                .muxer
                .as_ref()
                .and_then(|m| m.live_source)
                .unwrap_or(false),
        };
        let infer = InferConfig {
            stage_in_id: file
                .infer
                .as_ref()
                .and_then(|i| i.stage_in_id)
                .unwrap_or(DEFAULT_STAGE_IN_ID),
            stage_out_id: file
                .infer
                .as_ref()
                .and_then(|i| i.stage_out_id)
                .unwrap_or(DEFAULT_STAGE_OUT_ID),
            secondary_mode: file
                .infer
                .as_ref()
                .and_then(|i| i.secondary_mode)
                .unwrap_or(false),
            queue_depth: file
                .infer
                .as_ref()
                .and_then(|i| i.queue_depth)
                .unwrap_or(DEFAULT_QUEUE_DEPTH),
            pool_size: file
                .infer
                .as_ref()
                .and_then(|i| i.pool_size)
                .unwrap_or(DEFAULT_POOL_SIZE),
        };
        Self {
            channels: file.channels.unwrap_or(DEFAULT_CHANNELS),
            selector,
            muxer,
            infer,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(channels) = parse_env("FRAMEMUX_CHANNELS")? {
            self.channels = channels;
        }
        if let Some(depth) = parse_env("FRAMEMUX_MAX_QUEUE_SIZE")? {
            self.selector.max_queue_size = depth;
        }
        if let Ok(live) = std::env::var("FRAMEMUX_LIVE_SOURCE") {
            self.muxer.live_source = matches!(live.trim(), "1" | "true" | "yes");
        }
        if let Some(stage) = parse_env("FRAMEMUX_STAGE_IN_ID")? {
            self.infer.stage_in_id = stage;
        }
        if let Some(stage) = parse_env("FRAMEMUX_STAGE_OUT_ID")? {
            self.infer.stage_out_id = stage;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(anyhow!("pipeline needs at least one channel"));
        }
        if self.selector.max_queue_size == 0 {
            return Err(anyhow!("selector max_queue_size must be at least 1"));
        }
        if self.infer.queue_depth == 0 {
            return Err(anyhow!("infer queue_depth must be at least 1"));
        }
        if self.infer.pool_size == 0 {
            return Err(anyhow!("infer pool_size must be at least 1"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{key} must be an integer")),
        _ => Ok(None),
    }
}
