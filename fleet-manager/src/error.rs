/// Fleet-level failures, surfaced to callers that opt into `raise_on_error`.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("could not talk to printer: {0}")]
    Transport(#[from] fleet_core::Error),

    #[error("invalid request: {0}")]
    Value(String),

    #[error("SD upload failed: {0}")]
    Upload(String),

    #[error("print job failed: {0}")]
    Job(String),
}

impl FleetError {
    pub fn value(msg: impl Into<String>) -> Self {
        FleetError::Value(msg.into())
    }

    pub fn upload(msg: impl Into<String>) -> Self {
        FleetError::Upload(msg.into())
    }

    pub fn job(msg: impl Into<String>) -> Self {
        FleetError::Job(msg.into())
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
