use std::fs;
use std::path::Path;

use crate::proxy::NodeConfig;
use super::paths::get_data_dir;

const CONFIG_FILE: &str = "node_config.json";

/// Load node configuration, writing defaults on first run
pub fn load_node_config() -> Result<NodeConfig, String> {
    let data_dir = get_data_dir()?;
    load_node_config_from(&data_dir.join(CONFIG_FILE))
}

/// Save node configuration
pub fn save_node_config(config: &NodeConfig) -> Result<(), String> {
    let data_dir = get_data_dir()?;
    save_node_config_to(&data_dir.join(CONFIG_FILE), config)
}

pub fn load_node_config_from(config_path: &Path) -> Result<NodeConfig, String> {
    if !config_path.exists() {
        let config = NodeConfig::default();
        let _ = save_node_config_to(config_path, &config);
        return Ok(config);
    }

    let content = fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read config file: {}", e))?;

    serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse config file: {}", e))
}

pub fn save_node_config_to(config_path: &Path, config: &NodeConfig) -> Result<(), String> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(config_path, content)
        .map_err(|e| format!("Failed to save config: {}", e))
}
