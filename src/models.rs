// Data structures shared by the feed store, the real-time intake and the API.
//
// VBN open data:
// - GTFS Static: https://www.connect-info.net/opendata/gtfs/connect-nds-toplevel/wftdkvbsii
// - GTFS-RT (JSON): https://gtfsr.vbn.de/gtfsr_connect.json

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// Static Feed Tables
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub headsign: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub short_name: String,
    pub long_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival_time: String,   // HH:MM:SS, hours may exceed 23
    pub departure_time: String, // HH:MM:SS, hours may exceed 23
}

/// One complete build of the static feed. Never mutated once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub stops: HashMap<String, Stop>,
    pub trips: HashMap<String, Trip>,
    pub routes: HashMap<String, Route>,
    pub stop_times: Vec<StopTime>,
    pub last_updated: DateTime<Utc>,
}

impl FeedSnapshot {
    /// Short name of the line serving `route_id`, if the route is known.
    pub fn line_name(&self, route_id: &str) -> Option<&str> {
        self.routes.get(route_id).map(|r| r.short_name.as_str())
    }

    pub fn stop_name(&self, stop_id: &str) -> Option<&str> {
        self.stops
            .get(stop_id)
            .map(|s| s.stop_name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            last_updated: Some(self.last_updated),
            stop_count: self.stops.len(),
            trip_count: self.trips.len(),
            stop_time_count: self.stop_times.len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedStatus {
    pub last_updated: Option<DateTime<Utc>>,
    pub stop_count: usize,
    pub trip_count: usize,
    pub stop_time_count: usize,
}

// ============================================================================
// Real-time & API Records
// ============================================================================

/// Stop-level delay taken from one real-time trip update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayRecord {
    pub trip_id: String,
    pub route_id: String,
    pub stop_id: String,
    pub delay_minutes: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Departure {
    pub trip_id: String,
    pub line: String,
    pub destination: String,
    pub origin: String,
    pub departure_time: String,
    pub arrival_time: String,
    pub delay: i32,
    pub actual_departure_time: String,
    pub is_real: bool,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("File error: {0}")]
    FileError(String),
    #[error("GTFS data not loaded yet")]
    NotYetLoaded,
}

pub type Result<T> = std::result::Result<T, BoardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_departure_serializes_camel_case() {
        let departure = Departure {
            trip_id: "t1".to_string(),
            line: "6".to_string(),
            destination: "Bremen Hbf".to_string(),
            origin: "Bremen Haferkamp".to_string(),
            departure_time: "08:00:00".to_string(),
            arrival_time: "08:10:00".to_string(),
            delay: 2,
            actual_departure_time: "08:02:00".to_string(),
            is_real: true,
        };

        let json = serde_json::to_value(&departure).unwrap();
        assert_eq!(json["tripId"], "t1");
        assert_eq!(json["actualDepartureTime"], "08:02:00");
        assert_eq!(json["isReal"], true);
    }

    #[test]
    fn test_stop_name_ignores_empty_names() {
        let mut stops = HashMap::new();
        stops.insert(
            "s1".to_string(),
            Stop {
                stop_id: "s1".to_string(),
                stop_name: String::new(),
                latitude: 0.0,
                longitude: 0.0,
            },
        );
        let snapshot = FeedSnapshot {
            stops,
            trips: HashMap::new(),
            routes: HashMap::new(),
            stop_times: Vec::new(),
            last_updated: Utc::now(),
        };

        assert_eq!(snapshot.stop_name("s1"), None);
        assert_eq!(snapshot.stop_name("missing"), None);
        assert_eq!(snapshot.status().stop_count, 1);
    }
}
