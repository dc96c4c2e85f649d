use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/snapshot-engine/engine.toml";
const ENV_CONFIG_PATH: &str = "SNAPSHOT_ENGINE_CONFIG";

/// Tuning knobs for one engine instance.
///
/// The distilled spec leaves the operand-stack depth and queue capacity
/// numerically unspecified ("implementations should choose conservative
/// fixed bounds"); this config makes those bounds host-tunable instead of
/// compiled-in constants, the same way the host agent externalizes its own
/// runtime knobs.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `SNAPSHOT_ENGINE_CONFIG` environment variable. If the file is
    /// missing or fails to parse, defaults are returned — a missing config
    /// file is an expected condition for this agent, not an error.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_max_stack_frames")]
    pub max_stack_frames: usize,
    #[serde(default = "default_operand_stack_depth")]
    pub operand_stack_depth: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_output_buffer_capacity")]
    pub output_buffer_capacity: usize,
    #[serde(default = "default_stacks_map_capacity")]
    pub stacks_map_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_stack_frames: default_max_stack_frames(),
            operand_stack_depth: default_operand_stack_depth(),
            queue_capacity: default_queue_capacity(),
            output_buffer_capacity: default_output_buffer_capacity(),
            stacks_map_capacity: default_stacks_map_capacity(),
        }
    }
}

fn default_max_stack_frames() -> usize {
    512
}
fn default_operand_stack_depth() -> usize {
    64
}
fn default_queue_capacity() -> usize {
    4096
}
fn default_output_buffer_capacity() -> usize {
    4 * 1024 * 1024
}
fn default_stacks_map_capacity() -> usize {
    256
}
