use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to download chart: {0}")]
    DownloadFailed(#[from] reqwest::Error),

    #[error("SFService {0} not found")]
    ServiceNotFound(String),

    #[error("SFPlan {0} not found")]
    PlanNotFound(String),

    #[error("SFServiceInstance {0} not found")]
    InstanceNotFound(String),

    #[error("SFServiceBinding {0} not found")]
    BindingNotFound(String),

    #[error("template for action {action} not found in plan {plan_id}")]
    TemplateNotFound { action: String, plan_id: String },

    #[error("{kind} renderer failed: {message}")]
    Renderer { kind: String, message: String },

    #[error("file {0} not found in rendered output")]
    FileNotFound(String),

    #[error("invalid renderer input: {0}")]
    InvalidInput(String),

    #[error("failed to convert rendered document: {0}")]
    Conversion(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("conflict while writing {0}")]
    Conflict(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::KubeError(_) => "KubeError",
            Error::IoError(_) => "IoError",
            Error::DownloadFailed(_) => "DownloadFailed",
            Error::ServiceNotFound(_) => "ServiceNotFound",
            Error::PlanNotFound(_) => "PlanNotFound",
            Error::InstanceNotFound(_) => "InstanceNotFound",
            Error::BindingNotFound(_) => "BindingNotFound",
            Error::TemplateNotFound { .. } => "TemplateNotFound",
            Error::Renderer { .. } => "RendererError",
            Error::FileNotFound(_) => "FileNotFound",
            Error::InvalidInput(_) => "InvalidInput",
            Error::Conversion(_) => "ConversionError",
            Error::Precondition(_) => "PreconditionError",
            Error::Conflict(_) => "Conflict",
        }
    }

    pub(crate) fn renderer(kind: &str, message: impl ToString) -> Self {
        Error::Renderer {
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }

    /// True when a catalog object, a managed object or a plan template could not be resolved
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ServiceNotFound(_)
            | Error::PlanNotFound(_)
            | Error::InstanceNotFound(_)
            | Error::BindingNotFound(_)
            | Error::TemplateNotFound { .. } => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// True when a write lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// True when the API server rejected an object as invalid (HTTP 422)
    pub fn is_unprocessable(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 422)
    }
}

pub mod controllers;
pub use controllers::{run, State};

/// Operator tunables
pub mod config;

/// YAML to generic document conversion
pub mod dynamic;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Resource computation, reconciliation and status
pub mod reconcilers;

/// Template renderers
pub mod renderer;

/// Custom resources
pub mod resources;

/// Object store contract
pub mod store;
