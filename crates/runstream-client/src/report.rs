use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ReportError;
use crate::model::RunKey;

/// Post-run report returned by the reporting service.
///
/// Only `summary` is interpreted; every other field is kept as-is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RunReport {
    pub fn with_summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            fields: Map::new(),
        }
    }
}

/// Fetches the report of a finished run.
#[async_trait::async_trait]
pub trait ReportFetcher: Send + Sync {
    async fn fetch(&self, key: &RunKey) -> Result<RunReport, ReportError>;
}
