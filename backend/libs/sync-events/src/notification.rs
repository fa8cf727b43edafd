use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog event tag carried in the `type` field of a notification datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// A new title was added to the catalog
    #[serde(rename = "NEW_MANGA", alias = "manga_added")]
    NewManga,
    /// A new chapter was released for an existing title
    #[serde(rename = "NEW_CHAPTER", alias = "chapter_release")]
    NewChapter,
    /// Anything else
    #[serde(rename = "NOTIFY", other)]
    Notify,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NewManga => "NEW_MANGA",
            NotificationKind::NewChapter => "NEW_CHAPTER",
            NotificationKind::Notify => "NOTIFY",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog notification
///
/// `id` is owned by the broadcaster: whatever the caller puts there is
/// replaced with a fresh identifier right before the notification is encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub manga_id: String,
    #[serde(default)]
    pub message: String,
    /// Unix milliseconds; zero means "not set"
    #[serde(default)]
    pub timestamp: i64,
}

impl Notification {
    /// Create a notification stamped with the current time and no id
    pub fn new(
        kind: NotificationKind,
        manga_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            kind,
            manga_id: manga_id.into(),
            message: message.into(),
            timestamp: crate::now_millis(),
        }
    }

    /// Return a copy carrying a freshly generated id
    pub fn with_fresh_id(self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..self
        }
    }

    /// Fill in the current time if the caller left the timestamp empty
    pub fn with_default_timestamp(self) -> Self {
        if self.timestamp > 0 {
            return self;
        }
        Self {
            timestamp: crate::now_millis(),
            ..self
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
