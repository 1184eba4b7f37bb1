// GTFS static archive parsing: stops.txt, trips.txt, routes.txt and stop_times.txt.
//
// Columns are located by header name. When a header is absent the positional
// layout of the VBN export is assumed.

use crate::models::{BoardError, FeedSnapshot, Result, Route, Stop, StopTime, Trip};
use chrono::Utc;
use csv::StringRecord;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};
use zip::ZipArchive;

/// Parse the four tables out of a zipped GTFS feed.
///
/// `stop_times.txt` is reduced to the trips that call at `origin_stop_id`.
pub fn parse_archive<R: Read + Seek>(reader: R, origin_stop_id: &str) -> Result<FeedSnapshot> {
    let mut archive = ZipArchive::new(reader)
        .map_err(|e| BoardError::ParseError(format!("Failed to open GTFS zip archive: {}", e)))?;

    let stops = parse_stops(&read_table(&mut archive, "stops.txt")?)?;
    log::info!("   ✓ Parsed {} stops", stops.len());

    let trips = parse_trips(&read_table(&mut archive, "trips.txt")?)?;
    log::info!("   ✓ Parsed {} trips", trips.len());

    let routes = parse_routes(&read_table(&mut archive, "routes.txt")?)?;
    log::info!("   ✓ Parsed {} routes", routes.len());

    log::info!("📖 Parsing stop_times.txt (this may take a while)...");
    let stop_times = parse_stop_times(&read_table(&mut archive, "stop_times.txt")?, origin_stop_id)?;
    log::info!("   ✓ Kept {} stop times serving {}", stop_times.len(), origin_stop_id);

    Ok(FeedSnapshot {
        stops,
        trips,
        routes,
        stop_times,
        last_updated: Utc::now(),
    })
}

fn read_table<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<String> {
    let mut file = archive
        .by_name(name)
        .map_err(|e| BoardError::FileError(format!("{} not found in GTFS archive: {}", name, e)))?;

    let mut raw = Vec::new();
    file.read_to_end(&mut raw)
        .map_err(|e| BoardError::FileError(format!("Failed to read {}: {}", name, e)))?;

    Ok(String::from_utf8_lossy(&raw).into_owned())
}

// ============================================================================
// Table Reader
// ============================================================================

/// Header-aware view over one CSV table. Ragged rows are allowed.
struct Table<'a> {
    reader: csv::Reader<&'a [u8]>,
    headers: StringRecord,
}

impl<'a> Table<'a> {
    fn new(contents: &'a str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(contents.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| BoardError::ParseError(format!("Unreadable CSV header: {}", e)))?
            .clone();

        Ok(Table { reader, headers })
    }

    /// Index of `name` in the header row, or `fallback` if the header lacks it.
    fn column(&self, name: &str, fallback: usize) -> usize {
        self.headers
            .iter()
            .position(|h| clean(h) == name)
            .unwrap_or(fallback)
    }

    fn rows(&mut self) -> impl Iterator<Item = StringRecord> + '_ {
        self.reader.records().filter_map(|result| result.ok())
    }
}

/// Strip whitespace, a UTF-8 BOM and any stray quotes left around a field.
/// Drop a BOM, whitespace and one surrounding pair of quotes left over from
/// a field the reader did not unquote. Quotes inside the value are kept.
fn clean(field: &str) -> &str {
    let field = field.trim_start_matches('\u{feff}').trim();
    match field.strip_prefix('"').and_then(|f| f.strip_suffix('"')) {
        Some(inner) => inner.trim(),
        None => field,
    }
}

fn field(record: &StringRecord, index: usize) -> Option<&str> {
    record.get(index).map(clean)
}

// ============================================================================
// Tables
// ============================================================================

pub fn parse_stops(contents: &str) -> Result<HashMap<String, Stop>> {
    let mut table = Table::new(contents)?;
    let id_col = table.column("stop_id", 0);
    let name_col = table.column("stop_name", 2);
    let lat_col = table.column("stop_lat", 4);
    let lon_col = table.column("stop_lon", 5);

    let mut stops = HashMap::new();
    for record in table.rows() {
        let (Some(stop_id), Some(stop_name)) = (field(&record, id_col), field(&record, name_col)) else {
            continue;
        };
        if stop_id.is_empty() {
            continue;
        }

        let latitude = field(&record, lat_col)
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let longitude = field(&record, lon_col)
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        stops.insert(
            stop_id.to_string(),
            Stop {
                stop_id: stop_id.to_string(),
                stop_name: stop_name.to_string(),
                latitude,
                longitude,
            },
        );
    }

    Ok(stops)
}

pub fn parse_trips(contents: &str) -> Result<HashMap<String, Trip>> {
    let mut table = Table::new(contents)?;
    let route_col = table.column("route_id", 0);
    let service_col = table.column("service_id", 1);
    let trip_col = table.column("trip_id", 2);
    let headsign_col = table.column("trip_headsign", 3);

    let mut trips = HashMap::new();
    for record in table.rows() {
        if let (Some(route_id), Some(service_id), Some(trip_id)) = (
            field(&record, route_col),
            field(&record, service_col),
            field(&record, trip_col),
        ) {
            if trip_id.is_empty() {
                continue;
            }
            trips.insert(
                trip_id.to_string(),
                Trip {
                    trip_id: trip_id.to_string(),
                    route_id: route_id.to_string(),
                    service_id: service_id.to_string(),
                    headsign: field(&record, headsign_col).unwrap_or_default().to_string(),
                },
            );
        }
    }

    Ok(trips)
}

pub fn parse_routes(contents: &str) -> Result<HashMap<String, Route>> {
    let mut table = Table::new(contents)?;
    let id_col = table.column("route_id", 0);
    let short_col = table.column("route_short_name", 2);
    let long_col = table.column("route_long_name", 3);

    let mut routes = HashMap::new();
    for record in table.rows() {
        if let (Some(route_id), Some(short_name)) = (field(&record, id_col), field(&record, short_col)) {
            if route_id.is_empty() {
                continue;
            }
            routes.insert(
                route_id.to_string(),
                Route {
                    route_id: route_id.to_string(),
                    short_name: short_name.to_string(),
                    long_name: field(&record, long_col).unwrap_or_default().to_string(),
                },
            );
        }
    }

    Ok(routes)
}

/// Two passes over the table: collect the trips calling at the origin, then
/// keep every row of those trips in file order.
pub fn parse_stop_times(contents: &str, origin_stop_id: &str) -> Result<Vec<StopTime>> {
    let mut table = Table::new(contents)?;
    let trip_col = table.column("trip_id", 0);
    let stop_col = table.column("stop_id", 1);
    let seq_col = table.column("stop_sequence", 2);
    let arrival_col = table.column("arrival_time", 6);
    let departure_col = table.column("departure_time", 7);

    let relevant_trips: HashSet<String> = table
        .rows()
        .filter(|record| field(record, stop_col) == Some(origin_stop_id))
        .filter_map(|record| field(&record, trip_col).map(str::to_string))
        .collect();

    let mut table = Table::new(contents)?;
    let mut stop_times = Vec::new();
    for record in table.rows() {
        let Some(trip_id) = field(&record, trip_col) else {
            continue;
        };
        if !relevant_trips.contains(trip_id) {
            continue;
        }

        if let (Some(stop_id), Some(sequence), Some(arrival_time), Some(departure_time)) = (
            field(&record, stop_col),
            field(&record, seq_col).and_then(|s| s.parse::<u32>().ok()),
            field(&record, arrival_col),
            field(&record, departure_col),
        ) {
            stop_times.push(StopTime {
                trip_id: trip_id.to_string(),
                stop_id: stop_id.to_string(),
                stop_sequence: sequence,
                arrival_time: arrival_time.to_string(),
                departure_time: departure_time.to_string(),
            });
        }
    }

    Ok(stop_times)
}
