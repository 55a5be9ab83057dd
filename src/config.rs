use crate::plant::UNIT_CELSIUS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in parse_dotenv(&content) {
        // Only set if not already set (env vars take precedence)
        if std::env::var(key).is_err() {
            // SAFETY: called from main before the runtime starts any thread
            unsafe { std::env::set_var(key, value) };
        }
    }
}

fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            pairs.push((key, value));
        }
    }
    pairs
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub plant: PlantConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlantConfig {
    /// JSON file with plant records keyed by entry id.
    pub records_file: Option<PathBuf>,
    /// Config entries and restore data.
    pub state_file: PathBuf,
    pub temperature_unit: String,
    /// Local time zone as minutes east of UTC.
    pub utc_offset_minutes: i32,
    /// Shift of the daily DLI reset after local midnight.
    pub dli_reset_offset_minutes: i64,
    pub update_interval_secs: u64,
    pub simulate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic prefix of the host's state stream.
    pub statestream_prefix: String,
}

fn default_state_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("plant-monitor")
        .join("state.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plant: PlantConfig {
                records_file: None,
                state_file: default_state_file(),
                temperature_unit: UNIT_CELSIUS.to_string(),
                utc_offset_minutes: 0,
                dli_reset_offset_minutes: 0,
                update_interval_secs: 60,
                simulate: false,
            },
            mqtt: MqttConfig {
                enabled: false,
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                client_id: "plant-monitor".to_string(),
                username: None,
                password: None,
                statestream_prefix: "homeassistant".to_string(),
            },
        }
    }
}

fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PLANT_CONFIG") {
            config.plant.records_file = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("PLANT_STATE_FILE") {
            config.plant.state_file = PathBuf::from(path);
        }
        if let Ok(unit) = std::env::var("PLANT_TEMPERATURE_UNIT") {
            config.plant.temperature_unit = unit;
        }
        if let Ok(offset) = std::env::var("PLANT_UTC_OFFSET_MINUTES")
            && let Ok(o) = offset.parse()
        {
            config.plant.utc_offset_minutes = o;
        }
        if let Ok(offset) = std::env::var("PLANT_DLI_RESET_OFFSET_MINUTES")
            && let Ok(o) = offset.parse()
        {
            config.plant.dli_reset_offset_minutes = o;
        }
        if let Ok(interval) = std::env::var("PLANT_UPDATE_INTERVAL_SECS")
            && let Ok(i) = interval.parse()
        {
            config.plant.update_interval_secs = i;
        }
        if let Ok(simulate) = std::env::var("PLANT_SIMULATE") {
            config.plant.simulate = env_flag(&simulate);
        }

        // MQTT configuration
        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
            config.mqtt.enabled = true;
        }
        if let Ok(port) = std::env::var("MQTT_BROKER_PORT")
            && let Ok(p) = port.parse()
        {
            config.mqtt.broker_port = p;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        if let Ok(prefix) = std::env::var("MQTT_STATESTREAM_PREFIX") {
            config.mqtt.statestream_prefix = prefix;
        }

        config
    }
}
