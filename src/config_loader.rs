// Configuration loader for the Scribe API
//
// This module handles loading configuration from the TOML configuration file
// and environment variables with appropriate precedence.

use std::env;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use toml::Value;

const CONFIG_FILE_PATH: &str = "scribe_api.conf";

/// Loads configuration from the TOML file into the process environment.
///
/// Configuration precedence (highest to lowest):
/// 1. Environment variables
/// 2. Configuration file values
/// 3. Application defaults (handled by `config::defaults`)
///
/// # Returns
///
/// Returns true if the config file was successfully loaded, false otherwise
pub fn load_config() -> bool {
    load_config_from(Path::new(CONFIG_FILE_PATH))
}

fn load_config_from(config_path: &Path) -> bool {
    if !config_path.exists() {
        debug!("Configuration file not found at: {}", config_path.display());
        return false;
    }

    let config_content = match fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read configuration file: {}", e);
            return false;
        }
    };

    let config_values: Value = match config_content.parse() {
        Ok(values) => values,
        Err(e) => {
            warn!("Failed to parse configuration file: {}", e);
            return false;
        }
    };

    // TOML is expected to be flat (not nested); keys map 1:1 to env names.
    let mut applied = 0usize;
    if let Value::Table(table) = config_values {
        for (key, value) in table {
            let env_key = key.to_uppercase();

            // Environment wins over the file.
            if env::var(&env_key).is_ok() {
                debug!("{} already set in environment, keeping it", env_key);
                continue;
            }

            let rendered = match value {
                Value::String(s) => s,
                Value::Integer(i) => i.to_string(),
                Value::Float(f) => f.to_string(),
                Value::Boolean(b) => b.to_string(),
                other => {
                    warn!(
                        "Ignoring configuration key {} with unsupported type: {}",
                        key,
                        other.type_str()
                    );
                    continue;
                }
            };

            env::set_var(&env_key, rendered);
            applied += 1;
        }
    } else {
        warn!("Configuration file is not a flat TOML table, ignoring it");
        return false;
    }

    info!(
        "Loaded {} configuration values from {}",
        applied,
        config_path.display()
    );
    true
}
