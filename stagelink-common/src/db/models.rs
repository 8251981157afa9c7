//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named channel grouping one technician view and any number of musicians
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Room {
    pub id: i64,
    pub name: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// A monitor-mix adjustment ask from a musician to the technician
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Request {
    pub id: i64,
    #[serde(rename = "roomId")]
    pub room_id: i64,
    /// Originating performer label (free text, not a foreign key)
    pub musician: String,
    /// The performer's own instrument label
    pub instrument: String,
    #[serde(rename = "targetInstrument")]
    pub target_instrument: String,
    pub action: RequestAction,
    pub completed: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// A room-scoped, user-defined instrument label beyond the built-in set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CustomInstrument {
    pub id: i64,
    #[serde(rename = "roomId")]
    pub room_id: i64,
    pub name: String,
}

/// The six adjustment kinds a musician can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RequestAction {
    VolumeUp,
    VolumeDown,
    ReverbUp,
    ReverbDown,
    Thanks,
    Assistance,
}

impl RequestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestAction::VolumeUp => "volume_up",
            RequestAction::VolumeDown => "volume_down",
            RequestAction::ReverbUp => "reverb_up",
            RequestAction::ReverbDown => "reverb_down",
            RequestAction::Thanks => "thanks",
            RequestAction::Assistance => "assistance",
        }
    }
}

impl std::fmt::Display for RequestAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
