use serde::{Deserialize, Serialize};

/// A reading-progress event
///
/// `chapter` is a position marker and is deliberately not bounds-checked
/// here; the storage collaborator owns catalog-aware validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub user_id: String,
    pub manga_id: String,
    pub chapter: i64,
    /// Unix milliseconds, assigned by the server at ingestion
    #[serde(default)]
    pub timestamp: i64,
}

impl ProgressUpdate {
    pub fn new(user_id: impl Into<String>, manga_id: impl Into<String>, chapter: i64) -> Self {
        Self {
            user_id: user_id.into(),
            manga_id: manga_id.into(),
            chapter,
            timestamp: 0,
        }
    }

    /// Overwrite the timestamp with the server receive time
    pub fn stamped(self, timestamp: i64) -> Self {
        Self { timestamp, ..self }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
