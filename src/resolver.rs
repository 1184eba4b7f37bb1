// Departure resolution: scheduled departures between two stops, enriched with
// real-time delays.

use crate::models::{Departure, FeedSnapshot, StopTime};
use crate::realtime::{DelayIndex, TripDelayUpdate};
use chrono::{NaiveTime, Timelike};
use std::collections::{HashMap, HashSet};

const UNKNOWN_LINE: &str = "Unknown";
const UNKNOWN_DESTINATION: &str = "Ziel unbekannt";

#[derive(Debug, Clone)]
pub struct DepartureQuery {
    pub from: String,
    pub to: Vec<String>,
    /// Shown as origin when the snapshot has no name for `from`.
    pub origin_label: String,
    /// Candidates kept by the schedule scan before delays are merged.
    pub scan_limit: usize,
    /// Departures returned after the merge.
    pub limit: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct DelayPolicy {
    /// Borrow a same-line delay when the trip itself has no real-time record.
    pub line_fallback: bool,
}

/// Scan, merge and truncate in one go.
pub fn resolve(
    snapshot: &FeedSnapshot,
    updates: &[TripDelayUpdate],
    query: &DepartureQuery,
    now: NaiveTime,
    policy: DelayPolicy,
) -> Vec<Departure> {
    let scheduled = next_departures(snapshot, query, now);
    let index = DelayIndex::from_updates(updates, &query.from);
    if index.is_empty() {
        log::debug!("No realtime delays for {}, using schedule times", query.from);
    }
    let mut departures = merge_delays(scheduled, &index, snapshot, policy);

    log::info!(
        "✅ Found {} next departures, {} with delays",
        departures.len(),
        departures.iter().filter(|d| d.delay > 0).count()
    );

    departures.truncate(query.limit);
    departures
}

// ============================================================================
// Schedule Scan
// ============================================================================

pub fn next_departures(snapshot: &FeedSnapshot, query: &DepartureQuery, now: NaiveTime) -> Vec<Departure> {
    let now_minutes = now.hour() * 60 + now.minute();
    let destinations: HashSet<&str> = query.to.iter().map(String::as_str).collect();

    let mut destination_calls: HashMap<&str, Vec<&StopTime>> = HashMap::new();
    for stop_time in &snapshot.stop_times {
        if destinations.contains(stop_time.stop_id.as_str()) {
            destination_calls
                .entry(stop_time.trip_id.as_str())
                .or_default()
                .push(stop_time);
        }
    }

    let origin = snapshot
        .stop_name(&query.from)
        .unwrap_or(query.origin_label.as_str())
        .to_string();

    let mut departures = Vec::new();
    for stop_time in &snapshot.stop_times {
        if stop_time.stop_id != query.from {
            continue;
        }
        let Some(departure_minutes) = gtfs_minutes(&stop_time.departure_time) else {
            continue;
        };
        if departure_minutes <= now_minutes {
            continue;
        }

        // The destination must come later on the same trip
        let Some(arrival) = destination_calls
            .get(stop_time.trip_id.as_str())
            .and_then(|calls| calls.iter().find(|st| st.stop_sequence > stop_time.stop_sequence))
        else {
            continue;
        };

        let trip = snapshot.trips.get(&stop_time.trip_id);
        let line = trip
            .and_then(|t| snapshot.line_name(&t.route_id))
            .unwrap_or(UNKNOWN_LINE)
            .to_string();
        let destination = trip
            .map(|t| t.headsign.as_str())
            .filter(|h| !h.is_empty())
            .or_else(|| snapshot.stop_name(&arrival.stop_id))
            .unwrap_or(UNKNOWN_DESTINATION)
            .to_string();

        departures.push(Departure {
            trip_id: stop_time.trip_id.clone(),
            line,
            destination,
            origin: origin.clone(),
            departure_time: stop_time.departure_time.clone(),
            arrival_time: arrival.arrival_time.clone(),
            delay: 0,
            actual_departure_time: stop_time.departure_time.clone(),
            is_real: true,
        });
    }

    departures.sort_by_key(|d| gtfs_minutes(&d.departure_time).unwrap_or(u32::MAX));
    let total = departures.len();

    let unique = dedup_departures(departures);
    let unique_count = unique.len();

    let diverse = diversify_by_line(unique, query.scan_limit);
    log::info!(
        "📊 Found {} total, {} unique, showing {} diverse departures after {:02}:{:02}",
        total,
        unique_count,
        diverse.len(),
        now.hour(),
        now.minute()
    );
    for departure in &diverse {
        log::debug!(
            "  🚌 Line {} at {} to {}",
            departure.line, departure.departure_time, departure.destination
        );
    }

    diverse
}

/// Keep the first of every (line, departure time, destination).
pub fn dedup_departures(departures: Vec<Departure>) -> Vec<Departure> {
    let mut seen = HashSet::new();
    departures
        .into_iter()
        .filter(|d| seen.insert((d.line.clone(), d.departure_time.clone(), d.destination.clone())))
        .collect()
}

/// One departure per line first, then the rest in their original order.
pub fn diversify_by_line(departures: Vec<Departure>, max_results: usize) -> Vec<Departure> {
    let mut used_lines = HashSet::new();
    let (mut first_per_line, rest): (Vec<_>, Vec<_>) = departures
        .into_iter()
        .partition(|d| used_lines.insert(d.line.clone()));

    first_per_line.extend(rest);
    first_per_line.truncate(max_results);
    first_per_line
}

// ============================================================================
// Real-time Merge
// ============================================================================

pub fn merge_delays(
    departures: Vec<Departure>,
    index: &DelayIndex,
    snapshot: &FeedSnapshot,
    policy: DelayPolicy,
) -> Vec<Departure> {
    departures
        .into_iter()
        .map(|mut departure| {
            let exact = index.exact(&departure.trip_id).unwrap_or(0);
            let delay = if exact == 0 && policy.line_fallback {
                // a zero or missing trip delay borrows from the line
                line_fallback_delay(&departure.line, index, snapshot).unwrap_or(0)
            } else {
                exact
            };

            if delay != 0 {
                log::debug!(
                    "🔗 Trip {} (line {} at {}): {} min delay",
                    departure.trip_id, departure.line, departure.departure_time, delay
                );
            }

            departure.delay = delay;
            departure.actual_departure_time = add_minutes(&departure.departure_time, delay);
            departure
        })
        .collect()
}

/// Approximate match: the first positive delay reported for any trip of the
/// same line. Trip ids of the static and real-time feeds do not always agree,
/// so this may attach another vehicle's delay.
fn line_fallback_delay(line: &str, index: &DelayIndex, snapshot: &FeedSnapshot) -> Option<i32> {
    let record = index.records().iter().find(|record| {
        record.delay_minutes > 0 && snapshot.line_name(&record.route_id) == Some(line)
    })?;

    log::debug!(
        "🎯 Matched line {}: using {} min delay from trip {}",
        line, record.delay_minutes, record.trip_id
    );
    Some(record.delay_minutes)
}

// ============================================================================
// Time Helpers
// ============================================================================

/// Parse GTFS time format (HH:MM:SS, hours may exceed 23) to seconds since midnight.
pub fn parse_gtfs_time(time_str: &str) -> Option<u32> {
    let mut parts = time_str.trim().split(':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: u32 = parts.next().map_or(Some(0), |s| s.parse().ok())?;
    if parts.next().is_some() {
        return None;
    }

    Some(hours * 3600 + minutes * 60 + seconds)
}

fn gtfs_minutes(time_str: &str) -> Option<u32> {
    parse_gtfs_time(time_str).map(|seconds| seconds / 60)
}

/// Shift an HH:MM:SS time by whole minutes, wrapping around midnight.
pub fn add_minutes(time_str: &str, minutes: i32) -> String {
    if minutes == 0 {
        return time_str.to_string();
    }
    let Some(total_seconds) = parse_gtfs_time(time_str) else {
        return time_str.to_string();
    };

    let seconds = total_seconds % 60;
    let shifted = (total_seconds as i64 / 60 + minutes as i64).rem_euclid(24 * 60);
    format!("{:02}:{:02}:{:02}", shifted / 60, shifted % 60, seconds)
}

/// Shown when no static feed has been loaded yet.
pub fn fallback_departures() -> Vec<Departure> {
    [("15:45:00", "15:55:00", 0), ("16:00:00", "16:10:00", 2), ("16:15:00", "16:25:00", 0)]
        .into_iter()
        .enumerate()
        .map(|(i, (departure_time, arrival_time, delay))| Departure {
            trip_id: format!("fallback-{}", i + 1),
            line: "6".to_string(),
            destination: "Bremen Hbf".to_string(),
            origin: "Bremen Haferkamp".to_string(),
            departure_time: departure_time.to_string(),
            arrival_time: arrival_time.to_string(),
            delay,
            actual_departure_time: add_minutes(departure_time, delay),
            is_real: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Route, Stop, Trip};
    use crate::realtime::StopDelayUpdate;
    use chrono::Utc;

    const ORIGIN: &str = "000009013912";
    const HBF: &str = "000009013925";

    fn query(limit: usize) -> DepartureQuery {
        DepartureQuery {
            from: ORIGIN.to_string(),
            to: vec![HBF.to_string()],
            origin_label: "Bremen Haferkamp".to_string(),
            scan_limit: 10,
            limit,
        }
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn stop_time(trip_id: &str, stop_id: &str, seq: u32, time: &str) -> StopTime {
        StopTime {
            trip_id: trip_id.to_string(),
            stop_id: stop_id.to_string(),
            stop_sequence: seq,
            arrival_time: time.to_string(),
            departure_time: time.to_string(),
        }
    }

    /// Snapshot with one trip per entry of `trips`: (trip id, line, departure, headsign).
    fn snapshot(trips: &[(&str, &str, &str, &str)]) -> FeedSnapshot {
        let mut snapshot = FeedSnapshot {
            stops: HashMap::new(),
            trips: HashMap::new(),
            routes: HashMap::new(),
            stop_times: Vec::new(),
            last_updated: Utc::now(),
        };
        for (trip_id, line, departure, headsign) in trips {
            let route_id = format!("route-{}", line);
            snapshot.routes.insert(
                route_id.clone(),
                Route {
                    route_id: route_id.clone(),
                    short_name: line.to_string(),
                    long_name: String::new(),
                },
            );
            snapshot.trips.insert(
                trip_id.to_string(),
                Trip {
                    trip_id: trip_id.to_string(),
                    route_id,
                    service_id: "wk".to_string(),
                    headsign: headsign.to_string(),
                },
            );
            snapshot.stop_times.push(stop_time(trip_id, ORIGIN, 2, departure));
            let arrival = add_minutes(departure, 10);
            snapshot.stop_times.push(stop_time(trip_id, HBF, 5, &arrival));
        }
        snapshot
    }

    fn delay_update(trip_id: &str, route_id: &str, delay_seconds: i32) -> TripDelayUpdate {
        TripDelayUpdate {
            trip_id: trip_id.to_string(),
            route_id: route_id.to_string(),
            stop_updates: vec![StopDelayUpdate {
                stop_id: ORIGIN.to_string(),
                arrival_delay: None,
                departure_delay: Some(delay_seconds),
            }],
        }
    }

    const POLICY: DelayPolicy = DelayPolicy { line_fallback: true };

    #[test]
    fn test_parse_gtfs_time() {
        assert_eq!(parse_gtfs_time("08:10:30"), Some(8 * 3600 + 10 * 60 + 30));
        assert_eq!(parse_gtfs_time("25:00:00"), Some(25 * 3600));
        assert_eq!(parse_gtfs_time(" 7:05:00\r"), Some(7 * 3600 + 5 * 60));
        assert_eq!(parse_gtfs_time("garbage"), None);
        assert_eq!(parse_gtfs_time("1:2:3:4"), None);
    }

    #[test]
    fn test_add_minutes_rolls_over_midnight() {
        assert_eq!(add_minutes("23:50:00", 15), "00:05:00");
        assert_eq!(add_minutes("08:00:30", 2), "08:02:30");
        assert_eq!(add_minutes("00:03:00", -5), "23:58:00");
        assert_eq!(add_minutes("24:10:00", 5), "00:15:00");
        assert_eq!(add_minutes("08:00:00", 0), "08:00:00");
    }

    #[test]
    fn test_past_departures_are_never_returned() {
        let snapshot = snapshot(&[("early", "6", "07:59:00", "Bremen Hbf"), ("late", "6", "08:30:00", "Bremen Hbf")]);
        let departures = next_departures(&snapshot, &query(3), at(8, 0));

        assert_eq!(departures.len(), 1);
        assert_eq!(departures[0].trip_id, "late");
    }

    #[test]
    fn test_departure_in_current_minute_is_excluded() {
        let snapshot = snapshot(&[("now", "6", "08:00:00", "Bremen Hbf")]);
        assert!(next_departures(&snapshot, &query(3), at(8, 0)).is_empty());
    }

    #[test]
    fn test_destination_must_follow_origin() {
        let mut snapshot = snapshot(&[]);
        snapshot.stop_times = vec![
            stop_time("forward", ORIGIN, 2, "09:00:00"),
            stop_time("forward", HBF, 5, "09:10:00"),
            stop_time("backward", HBF, 2, "09:00:00"),
            stop_time("backward", ORIGIN, 5, "09:10:00"),
        ];

        let departures = next_departures(&snapshot, &query(3), at(8, 0));
        assert_eq!(departures.len(), 1);
        assert_eq!(departures[0].trip_id, "forward");
        assert_eq!(departures[0].arrival_time, "09:10:00");
    }

    #[test]
    fn test_missing_trip_and_route_get_placeholders() {
        let mut snapshot = snapshot(&[]);
        snapshot.stop_times = vec![stop_time("ghost", ORIGIN, 1, "09:00:00"), stop_time("ghost", HBF, 2, "09:10:00")];

        let departures = next_departures(&snapshot, &query(3), at(8, 0));
        assert_eq!(departures[0].line, "Unknown");
        assert_eq!(departures[0].destination, "Ziel unbekannt");
        assert_eq!(departures[0].origin, "Bremen Haferkamp");

        snapshot.stops.insert(
            HBF.to_string(),
            Stop {
                stop_id: HBF.to_string(),
                stop_name: "Bremen Hauptbahnhof".to_string(),
                latitude: 53.08,
                longitude: 8.81,
            },
        );
        let departures = next_departures(&snapshot, &query(3), at(8, 0));
        assert_eq!(departures[0].destination, "Bremen Hauptbahnhof");
    }

    #[test]
    fn test_identical_departures_collapse() {
        let snapshot = snapshot(&[("t1", "6", "09:00:00", "Universität"), ("t2", "6", "09:00:00", "Universität")]);
        let departures = next_departures(&snapshot, &query(3), at(8, 0));

        assert_eq!(departures.len(), 1);
        assert_eq!(departures[0].trip_id, "t1");
    }

    #[test]
    fn test_one_departure_per_line_first() {
        let snapshot = snapshot(&[
            ("a1", "A", "09:00:00", "x"),
            ("a2", "A", "09:05:00", "x"),
            ("b1", "B", "09:10:00", "x"),
            ("a3", "A", "09:15:00", "x"),
            ("c1", "C", "09:20:00", "x"),
        ]);
        let departures = next_departures(&snapshot, &query(10), at(8, 0));
        let lines: Vec<&str> = departures.iter().map(|d| d.line.as_str()).collect();
        let trips: Vec<&str> = departures.iter().map(|d| d.trip_id.as_str()).collect();

        assert_eq!(&lines[..3], &["A", "B", "C"]);
        assert_eq!(trips, vec!["a1", "b1", "c1", "a2", "a3"]);
    }

    #[test]
    fn test_diversify_respects_max_results() {
        let snapshot = snapshot(&[
            ("a1", "A", "09:00:00", "x"),
            ("a2", "A", "09:05:00", "x"),
            ("b1", "B", "09:10:00", "x"),
        ]);
        let departures = next_departures(&snapshot, &query(3), at(8, 0));
        let limited = diversify_by_line(departures, 2);

        assert_eq!(limited.iter().map(|d| d.trip_id.as_str()).collect::<Vec<_>>(), vec!["a1", "b1"]);
    }

    #[test]
    fn test_exact_trip_delay_wins_over_line_match() {
        let snapshot = snapshot(&[("t1", "6", "09:00:00", "Bremen Hbf"), ("t2", "6", "09:15:00", "Bremen Hbf")]);
        let updates = vec![delay_update("t9", "route-6", 600), delay_update("t1", "route-6", 180)];

        let departures = resolve(&snapshot, &updates, &query(3), at(8, 0), POLICY);
        assert_eq!(departures[0].trip_id, "t1");
        assert_eq!(departures[0].delay, 3);
        assert_eq!(departures[0].actual_departure_time, "09:03:00");
        // t2 has no record of its own and borrows the first positive same-line delay
        assert_eq!(departures[1].delay, 10);
    }

    #[test]
    fn test_zero_trip_delay_falls_back_to_line() {
        let snapshot = snapshot(&[("t1", "6", "09:00:00", "Bremen Hbf")]);
        let updates = vec![delay_update("t1", "route-6", 0), delay_update("t9", "route-6", 600)];

        let departures = resolve(&snapshot, &updates, &query(3), at(8, 0), POLICY);
        assert_eq!(departures[0].delay, 10);
        assert_eq!(departures[0].actual_departure_time, "09:10:00");

        let strict = resolve(&snapshot, &updates, &query(3), at(8, 0), DelayPolicy { line_fallback: false });
        assert_eq!(strict[0].delay, 0);
    }

    #[test]
    fn test_negative_trip_delay_is_kept() {
        let snapshot = snapshot(&[("t1", "6", "09:00:00", "Bremen Hbf")]);
        let updates = vec![delay_update("t1", "route-6", -120), delay_update("t9", "route-6", 600)];

        let departures = resolve(&snapshot, &updates, &query(3), at(8, 0), POLICY);
        assert_eq!(departures[0].delay, -2);
        assert_eq!(departures[0].actual_departure_time, "08:58:00");
    }

    #[test]
    fn test_line_fallback_can_be_disabled() {
        let snapshot = snapshot(&[("t2", "6", "09:15:00", "Bremen Hbf")]);
        let updates = vec![delay_update("t9", "route-6", 600)];

        let strict = resolve(&snapshot, &updates, &query(3), at(8, 0), DelayPolicy { line_fallback: false });
        assert_eq!(strict[0].delay, 0);
    }

    #[test]
    fn test_line_fallback_ignores_other_lines_and_early_trips() {
        let snapshot = snapshot(&[("t1", "6", "09:00:00", "Bremen Hbf"), ("t4", "4", "09:30:00", "Bremen Hbf")]);
        let updates = vec![delay_update("t8", "route-4", -120), delay_update("t9", "route-4", 240)];

        let departures = resolve(&snapshot, &updates, &query(3), at(8, 0), POLICY);
        assert_eq!(departures[0].line, "6");
        assert_eq!(departures[0].delay, 0);
        assert_eq!(departures[1].line, "4");
        assert_eq!(departures[1].delay, 4);
    }

    #[test]
    fn test_no_delay_records_means_schedule_unchanged() {
        let snapshot = snapshot(&[("t1", "6", "09:00:00", "Bremen Hbf"), ("t2", "4", "09:15:00", "Bremen Hbf")]);
        let departures = resolve(&snapshot, &[], &query(3), at(8, 0), POLICY);

        assert_eq!(departures.len(), 2);
        for departure in departures {
            assert_eq!(departure.delay, 0);
            assert_eq!(departure.actual_departure_time, departure.departure_time);
        }
    }

    #[test]
    fn test_single_trip_end_to_end() {
        let mut snapshot = snapshot(&[]);
        snapshot.stop_times = vec![stop_time("t1", ORIGIN, 1, "08:00:00"), stop_time("t1", HBF, 2, "08:10:00")];

        let departures = resolve(&snapshot, &[], &query(3), at(7, 0), POLICY);
        assert_eq!(departures.len(), 1);
        assert_eq!(departures[0].delay, 0);
        assert_eq!(departures[0].departure_time, "08:00:00");
        assert_eq!(departures[0].arrival_time, "08:10:00");
        assert_eq!(departures[0].actual_departure_time, "08:00:00");
    }

    #[test]
    fn test_resolve_truncates_to_limit() {
        let snapshot = snapshot(&[
            ("a1", "A", "09:00:00", "x"),
            ("b1", "B", "09:05:00", "x"),
            ("c1", "C", "09:10:00", "x"),
            ("d1", "D", "09:15:00", "x"),
        ]);
        assert_eq!(resolve(&snapshot, &[], &query(3), at(8, 0), POLICY).len(), 3);
        assert_eq!(resolve(&snapshot, &[], &query(1), at(8, 0), POLICY).len(), 1);
    }

    #[test]
    fn test_fallback_departures() {
        let fallback = fallback_departures();

        assert_eq!(fallback.len(), 3);
        assert!(fallback.iter().all(|d| !d.is_real && d.line == "6"));
        assert_eq!(fallback[1].delay, 2);
        assert_eq!(fallback[1].actual_departure_time, "16:02:00");
    }
}
