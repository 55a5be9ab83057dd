use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum PlantError {
    #[error("Refuse to update non-plant entity: {0}")]
    UnknownMeter(String),

    #[error("{0} is not a sensor")]
    NotASensor(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Plant not found: {0}")]
    PlantNotFound(String),

    #[error("Invalid plant config for entry {entry_id}: {reason}")]
    InvalidConfig { entry_id: String, reason: String },

    #[error("Species lookup failed: {0}")]
    SpeciesLookup(String),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PlantError>;
