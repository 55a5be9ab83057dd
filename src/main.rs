use clap::Parser;
use log::{error, info, warn};
use plant_monitor::config::{Config, load_dotenv};
use plant_monitor::host::{ConfigRecord, InMemoryHost};
use plant_monitor::input::mqtt::StatestreamBridge;
use plant_monitor::input::simulation;
use plant_monitor::persistence::FileStore;
use plant_monitor::plant::{DaySchedule, PlantContext, PlantDevice};
use plant_monitor::service::PlantRegistry;
use plant_monitor::{PlantError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

const DAY_BOUNDARY_CHECK: Duration = Duration::from_secs(60);
const SIMULATION_PERIOD: Duration = Duration::from_secs(30);
const FLUSH_PERIOD: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "plant-monitor")]
#[command(about = "Houseplant monitoring on top of home-automation sensors")]
struct Cli {
    /// JSON file with plant records keyed by entry id
    #[arg(long, env = "PLANT_CONFIG")]
    config: Option<PathBuf>,

    /// File holding config entries and restore data
    #[arg(long, env = "PLANT_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Seconds between sensor polls
    #[arg(long, env = "PLANT_UPDATE_INTERVAL_SECS")]
    update_interval: Option<u64>,

    /// Feed plants from dummy sensors
    #[arg(long)]
    simulate: bool,

    /// Follow the MQTT state stream of this broker
    #[arg(long, env = "MQTT_BROKER_HOST")]
    mqtt_host: Option<String>,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn load_records(path: &Path) -> Result<BTreeMap<String, ConfigRecord>> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn build_config(cli: Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(path) = cli.config {
        config.plant.records_file = Some(path);
    }
    if let Some(path) = cli.state_file {
        config.plant.state_file = path;
    }
    if let Some(secs) = cli.update_interval {
        config.plant.update_interval_secs = secs;
    }
    if let Some(host) = cli.mqtt_host {
        config.mqtt.broker_host = host;
        config.mqtt.enabled = true;
    }
    config.plant.simulate |= cli.simulate;
    config
}

async fn run(config: Config) -> Result<()> {
    info!("Configuration loaded:");
    info!("  Temperature unit: {}", config.plant.temperature_unit);
    info!("  Update interval: {}s", config.plant.update_interval_secs);

    let host = Arc::new(InMemoryHost::new(config.plant.temperature_unit.clone()));
    let store = Arc::new(FileStore::open(&config.plant.state_file));
    info!("Using state file {:?}", store.path());

    if let Some(path) = &config.plant.records_file {
        for (entry_id, record) in load_records(path)? {
            if store.seed_entry(&entry_id, record) {
                info!("Added plant entry {} from {:?}", entry_id, path);
            }
        }
        store.flush().await?;
    }

    if config.plant.simulate {
        simulation::tick(&host);
    }

    let schedule = DaySchedule::from_minutes(
        config.plant.utc_offset_minutes,
        config.plant.dli_reset_offset_minutes,
    );
    let registry = Arc::new(PlantRegistry::new(host.clone()));
    for entry_id in store.entry_ids() {
        let ctx = PlantContext::in_memory(entry_id.clone(), host.clone())
            .with_stores(store.clone(), store.clone())
            .with_schedule(schedule);
        match PlantDevice::setup(ctx).await {
            Ok(plant) => registry.add(plant),
            Err(e) => error!("Failed to set up plant {}: {}", entry_id, e),
        }
    }
    if registry.is_empty() {
        warn!("No plants configured, set PLANT_CONFIG to a records file");
        return Err(PlantError::PlantNotFound("no plants configured".into()));
    }

    let events = tokio::spawn(registry.clone().run(host.subscribe()));

    let updater = {
        let registry = registry.clone();
        let period = Duration::from_secs(config.plant.update_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                registry.update_all().await;
            }
        })
    };

    let day_boundary = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DAY_BOUNDARY_CHECK);
            loop {
                interval.tick().await;
                registry.check_day_boundaries().await;
            }
        })
    };

    let flusher = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_PERIOD);
            loop {
                interval.tick().await;
                if let Err(e) = store.flush().await {
                    warn!("Failed to write {:?}: {}", store.path(), e);
                }
            }
        })
    };

    let simulation = config
        .plant
        .simulate
        .then(|| simulation::run_sensor_simulation(host.clone(), SIMULATION_PERIOD));
    let mqtt = config
        .mqtt
        .enabled
        .then(|| StatestreamBridge::new(config.mqtt.clone(), host.clone()).start());

    info!("Plant monitor is running with {} plant(s)", registry.len());
    info!("  - Press Ctrl+C to exit");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    for task in [Some(updater), Some(day_boundary), Some(flusher), simulation, mqtt]
        .into_iter()
        .flatten()
    {
        task.abort();
    }
    events.abort();

    registry.persist_all().await;
    store.flush().await?;
    registry.log_diagnostics();
    info!("Plant monitor stopped");
    Ok(())
}

fn main() {
    // Before the runtime exists, so setting env vars is single-threaded.
    load_dotenv();
    init_logger();
    let config = build_config(Cli::parse());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!("{}", e);
        std::process::exit(1);
    }
}
