use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One observation of a repository matching a search keyword.
///
/// Events are constructed once by the event source and never mutated;
/// stages read them from a shared batch and emit new values.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct DiscoveryEvent {
    pub repository_name: String,
    pub keyword: String,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    pub popularity_signal: u64,
    pub languages: Vec<String>,
}

impl DiscoveryEvent {
    pub fn key(&self) -> String {
        format!("{}:{}", self.keyword, self.repository_name)
    }
}

/// A record emitted by one of the pipeline stages onto the merged
/// downstream channel. Tagged so a CLI printer or HTTP consumer can
/// dispatch on `kind` without knowing which stage produced it.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackerUpdate {
    NewRepo {
        keyword: String,
        repository_name: String,
    },
    LangStats {
        keyword: String,
        language: String,
        count: u64,
    },
    TopRanked {
        keyword: String,
        repository_name: String,
        rank: usize,
    },
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::{DiscoveryEvent, TrackerUpdate};

    #[test]
    fn update_serializes_with_kind_tag() {
        let update = TrackerUpdate::NewRepo {
            keyword: "rust".to_string(),
            repository_name: "acme/widget".to_string(),
        };

        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["kind"], "new_repo");
        assert_eq!(value["repository_name"], "acme/widget");
    }

    #[test]
    fn event_round_trips_rfc3339_timestamps() {
        let event = DiscoveryEvent {
            repository_name: "acme/widget".to_string(),
            keyword: "rust".to_string(),
            observed_at: datetime!(2024-03-01 12:00:00 UTC),
            popularity_signal: 3,
            languages: vec!["Rust".to_string()],
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("2024-03-01T12:00:00Z"));

        let decoded: DiscoveryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.key(), "rust:acme/widget");
    }
}
