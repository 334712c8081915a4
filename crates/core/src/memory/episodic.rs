//! # Episodes
//!
//! Named, append-only event logs. An episode is open from `start` until
//! `end`; recording into a closed episode is an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Vec<EpisodeEvent>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Episode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            events: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub(crate) fn record(&mut self, kind: &str, data: serde_json::Value) {
        self.events.push(EpisodeEvent {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            data,
        });
    }

    pub(crate) fn close(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    /// Wall-clock length in milliseconds (up to now for open episodes)
    pub fn duration_ms(&self) -> i64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_kept_in_order() {
        let mut episode = Episode::new("run:abc");
        episode.record("phase", serde_json::json!("analyzing"));
        episode.record("phase", serde_json::json!("building"));
        episode.close();

        assert!(!episode.is_open());
        let phases: Vec<_> = episode.events.iter().map(|e| e.data.clone()).collect();
        assert_eq!(phases, vec![serde_json::json!("analyzing"), serde_json::json!("building")]);
        assert!(episode.duration_ms() >= 0);
    }
}
