// GTFS-RT trip update intake.
//
// VBN publishes its real-time feed as JSON (gtfsr_connect.json); the standard
// protobuf encoding is accepted as well. Both are reduced to TripDelayUpdate.

use crate::models::{BoardError, DelayRecord, Result};
use gtfs_rt::FeedMessage;
use prost::Message;
use reqwest::blocking;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TripDelayUpdate {
    pub trip_id: String,
    pub route_id: String,
    pub stop_updates: Vec<StopDelayUpdate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopDelayUpdate {
    pub stop_id: String,
    pub arrival_delay: Option<i32>,   // seconds
    pub departure_delay: Option<i32>, // seconds
}

/// Delays observed at one stop, keyed by trip, plus the ordered records used
/// for line-based matching.
#[derive(Debug, Clone, Default)]
pub struct DelayIndex {
    by_trip: HashMap<String, i32>,
    records: Vec<DelayRecord>,
}

impl DelayIndex {
    pub fn from_updates(updates: &[TripDelayUpdate], stop_id: &str) -> Self {
        let mut index = DelayIndex::default();
        let mut trips_at_stop = 0usize;

        for update in updates {
            let Some(stop_update) = update.stop_updates.iter().find(|s| s.stop_id == stop_id) else {
                continue;
            };
            trips_at_stop += 1;

            let Some(delay_seconds) = stop_update.departure_delay.or(stop_update.arrival_delay) else {
                continue;
            };
            let delay_minutes = seconds_to_minutes(delay_seconds);

            index.by_trip.insert(update.trip_id.clone(), delay_minutes);
            index.records.push(DelayRecord {
                trip_id: update.trip_id.clone(),
                route_id: update.route_id.clone(),
                stop_id: stop_update.stop_id.clone(),
                delay_minutes,
            });

            if delay_minutes != 0 {
                log::debug!(
                    "⏰ Delay for trip {} (route {}): {} minutes",
                    update.trip_id, update.route_id, delay_minutes
                );
            }
        }

        log::info!(
            "📊 Realtime summary: {} trips at {}, {} with delay data",
            trips_at_stop,
            stop_id,
            index.records.len()
        );
        index
    }

    pub fn exact(&self, trip_id: &str) -> Option<i32> {
        self.by_trip.get(trip_id).copied()
    }

    pub fn records(&self) -> &[DelayRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Whole minutes, halves rounded up (-90s is -1, 90s is 2).
fn seconds_to_minutes(seconds: i32) -> i32 {
    (seconds as f64 / 60.0 + 0.5).floor() as i32
}

// ============================================================================
// Feed Decoding
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonFeed {
    #[serde(default)]
    entity: Option<Vec<JsonEntity>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonEntity {
    #[serde(default)]
    trip_update: Option<JsonTripUpdate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonTripUpdate {
    #[serde(default)]
    trip: Option<JsonTripDescriptor>,
    #[serde(default)]
    stop_time_update: Option<Vec<JsonStopTimeUpdate>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonTripDescriptor {
    trip_id: Option<String>,
    route_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonStopTimeUpdate {
    stop_id: Option<String>,
    arrival: Option<JsonStopTimeEvent>,
    departure: Option<JsonStopTimeEvent>,
}

#[derive(Debug, Deserialize)]
struct JsonStopTimeEvent {
    delay: Option<i32>,
}

/// Decode a feed body, choosing JSON or protobuf by its first byte.
pub fn decode_feed(body: &[u8]) -> Result<Vec<TripDelayUpdate>> {
    let first = body.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'{') {
        decode_json(body)
    } else {
        decode_protobuf(body)
    }
}

fn decode_json(body: &[u8]) -> Result<Vec<TripDelayUpdate>> {
    let feed: JsonFeed = serde_json::from_slice(body)
        .map_err(|e| BoardError::ParseError(format!("Failed to decode realtime JSON: {}", e)))?;

    let updates = feed
        .entity
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entity| entity.trip_update)
        .filter_map(|trip_update| {
            let trip = trip_update.trip?;
            let trip_id = trip.trip_id?;
            let stop_updates = trip_update
                .stop_time_update
                .unwrap_or_default()
                .into_iter()
                .filter_map(|stu| {
                    Some(StopDelayUpdate {
                        stop_id: stu.stop_id?,
                        arrival_delay: stu.arrival.and_then(|a| a.delay),
                        departure_delay: stu.departure.and_then(|d| d.delay),
                    })
                })
                .collect();

            Some(TripDelayUpdate {
                trip_id,
                route_id: trip.route_id.unwrap_or_default(),
                stop_updates,
            })
        })
        .collect();

    Ok(updates)
}

fn decode_protobuf(body: &[u8]) -> Result<Vec<TripDelayUpdate>> {
    let feed = FeedMessage::decode(body)
        .map_err(|e| BoardError::ParseError(format!("Failed to decode realtime feed: {}", e)))?;

    let updates = feed
        .entity
        .into_iter()
        .filter_map(|entity| entity.trip_update)
        .filter_map(|trip_update| {
            let trip_id = trip_update.trip.trip_id.clone()?;
            let stop_updates = trip_update
                .stop_time_update
                .into_iter()
                .filter_map(|stu| {
                    Some(StopDelayUpdate {
                        stop_id: stu.stop_id?,
                        arrival_delay: stu.arrival.and_then(|a| a.delay),
                        departure_delay: stu.departure.and_then(|d| d.delay),
                    })
                })
                .collect();

            Some(TripDelayUpdate {
                trip_id,
                route_id: trip_update.trip.route_id.unwrap_or_default(),
                stop_updates,
            })
        })
        .collect();

    Ok(updates)
}

// ============================================================================
// Sources
// ============================================================================

pub trait RealtimeSource: Send + Sync {
    fn fetch_updates(&self) -> Result<Vec<TripDelayUpdate>>;
}

pub struct HttpRealtimeSource {
    url: String,
    timeout: Duration,
}

impl HttpRealtimeSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        HttpRealtimeSource {
            url: url.into(),
            timeout,
        }
    }
}

impl RealtimeSource for HttpRealtimeSource {
    fn fetch_updates(&self) -> Result<Vec<TripDelayUpdate>> {
        let client = blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| BoardError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        let response = client
            .get(&self.url)
            .send()
            .map_err(|e| BoardError::NetworkError(format!("Failed to fetch realtime feed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BoardError::NetworkError(format!(
                "Realtime request failed with status: {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .map_err(|e| BoardError::NetworkError(format!("Failed to read realtime response: {}", e)))?;

        let updates = decode_feed(&body)?;
        log::info!("🔄 Processing {} realtime trip updates...", updates.len());
        Ok(updates)
    }
}

/// Reuses a successful fetch for `ttl`. Concurrent callers wait on the same fetch.
pub struct CachedRealtimeSource<S> {
    inner: S,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Vec<TripDelayUpdate>)>>,
}

impl<S: RealtimeSource> CachedRealtimeSource<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        CachedRealtimeSource {
            inner,
            ttl,
            cached: Mutex::new(None),
        }
    }
}

impl<S: RealtimeSource> RealtimeSource for CachedRealtimeSource<S> {
    fn fetch_updates(&self) -> Result<Vec<TripDelayUpdate>> {
        if self.ttl.is_zero() {
            return self.inner.fetch_updates();
        }

        let Ok(mut cached) = self.cached.lock() else {
            return self.inner.fetch_updates();
        };

        if let Some((fetched_at, updates)) = cached.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(updates.clone());
            }
        }

        let updates = self.inner.fetch_updates()?;
        *cached = Some((Instant::now(), updates.clone()));
        Ok(updates)
    }
}
