mod audit_pipeline;
mod discovery;
mod fetcher_impls;
mod fetcher_traits;
mod preflight;
mod tracker;

pub use audit_pipeline::*;
pub use discovery::*;
pub use fetcher_traits::*;
pub use preflight::*;
pub use tracker::*;

use serde::Serialize;

/// How a job run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Completed,
    /// Stopped early by the failure-rate trip.
    Aborted,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
        }
    }
}
