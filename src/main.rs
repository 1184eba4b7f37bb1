// VBN Info Board backend
// Next departures Bremen Haferkamp → Bremen Hauptbahnhof from VBN GTFS + GTFS-RT

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

mod config;
mod feed_store;
mod gtfs_static;
mod models;
mod realtime;
mod resolver;

use config::Config;
use feed_store::{FeedStore, HttpArchiveSource, RefreshOutcome};
use models::{BoardError, Departure};
use realtime::{CachedRealtimeSource, HttpRealtimeSource, RealtimeSource};
use resolver::{DelayPolicy, DepartureQuery};

const MAX_LIMIT: usize = 20;

#[derive(Clone)]
struct AppState {
    store: Arc<FeedStore>,
    realtime: Arc<dyn RealtimeSource>,
    defaults: DepartureQuery,
    policy: DelayPolicy,
    timezone: Tz,
    clock: fn() -> DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct DeparturesParams {
    from: Option<String>,
    to: Option<String>,
    // kept as text so a malformed value falls back to the default instead of a 400
    limit: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeparturesResponse {
    success: bool,
    last_updated: Option<DateTime<Utc>>,
    routes: Vec<Departure>,
    source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl DeparturesResponse {
    fn fallback(message: String) -> Self {
        DeparturesResponse {
            success: false,
            last_updated: None,
            routes: resolver::fallback_departures(),
            source: "fallback",
            message: Some(message),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: &'static str,
    feed_last_updated: Option<DateTime<Utc>>,
    stop_count: usize,
    trip_count: usize,
    stop_time_count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    success: bool,
    message: String,
    last_updated: Option<DateTime<Utc>>,
}

impl AppState {
    fn departure_query(&self, params: &DeparturesParams) -> DepartureQuery {
        let mut query = self.defaults.clone();

        if let Some(from) = params.from.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            query.from = from.to_string();
        }
        if let Some(to) = &params.to {
            let stops: Vec<String> = to
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !stops.is_empty() {
                query.to = stops;
            }
        }
        match params.limit.as_deref().map(|s| s.trim().parse::<i64>()) {
            Some(Ok(limit)) => {
                query.limit = limit.clamp(1, MAX_LIMIT as i64) as usize;
                query.scan_limit = query.scan_limit.max(query.limit);
            }
            Some(Err(_)) => log::debug!("Ignoring invalid limit {:?}", params.limit),
            None => {}
        }

        query
    }
}

// ============================================================================
// API Endpoints
// ============================================================================

async fn get_departures(state: web::Data<AppState>, params: web::Query<DeparturesParams>) -> HttpResponse {
    let query = state.departure_query(&params);

    let Some(snapshot) = state.store.current() else {
        log::warn!("⚠️  {}, serving fallback departures", BoardError::NotYetLoaded);
        return HttpResponse::Ok().json(DeparturesResponse::fallback(BoardError::NotYetLoaded.to_string()));
    };

    if query.from != state.defaults.from {
        log::debug!(
            "Departures requested from {}; stop_times only cover trips serving {}",
            query.from, state.defaults.from
        );
    }

    log::info!("🚌 Getting next departures from {} to {}...", query.from, query.to.join(","));

    let now = (state.clock)().with_timezone(&state.timezone).time();
    let realtime = state.realtime.clone();
    let policy = state.policy;
    let last_updated = snapshot.last_updated;

    let resolved = tokio::task::spawn_blocking(move || {
        let updates = realtime.fetch_updates().unwrap_or_else(|e| {
            log::warn!("⚠️  Realtime data unavailable ({}), using schedule only", e);
            Vec::new()
        });
        resolver::resolve(&snapshot, &updates, &query, now, policy)
    })
    .await;

    match resolved {
        Ok(routes) => HttpResponse::Ok().json(DeparturesResponse {
            success: true,
            last_updated: Some(last_updated),
            routes,
            source: "VBN GTFS + Realtime API",
            message: None,
        }),
        Err(e) => {
            log::error!("❌ Departure resolution panicked: {}", e);
            HttpResponse::Ok().json(DeparturesResponse::fallback("Departure resolution failed".to_string()))
        }
    }
}

async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    let status = state.store.status();
    HttpResponse::Ok().json(StatusResponse {
        status: "running",
        feed_last_updated: status.last_updated,
        stop_count: status.stop_count,
        trip_count: status.trip_count,
        stop_time_count: status.stop_time_count,
    })
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    log::info!("🔄 Manual GTFS update requested...");

    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.refresh(true)).await {
        Ok(Ok(_)) => {
            log::info!("✓ Manual refresh completed successfully");
            HttpResponse::Ok().json(RefreshResponse {
                success: true,
                message: "GTFS data updated successfully".to_string(),
                last_updated: state.store.status().last_updated,
            })
        }
        Ok(Err(e)) => {
            log::error!("⚠️  Manual refresh failed: {}", e);
            HttpResponse::InternalServerError().json(RefreshResponse {
                success: false,
                message: format!("Error updating GTFS data: {}", e),
                last_updated: state.store.status().last_updated,
            })
        }
        Err(e) => {
            log::error!("❌ Manual refresh task panicked: {}", e);
            HttpResponse::InternalServerError().json(RefreshResponse {
                success: false,
                message: "Refresh task panicked".to_string(),
                last_updated: state.store.status().last_updated,
            })
        }
    }
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "VBN Info Board Backend",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().timestamp(),
    }))
}

fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check)).service(
        web::scope("/api")
            .route("/departures", web::get().to(get_departures))
            .route("/haferkamp-hbf", web::get().to(get_departures))
            .route("/status", web::get().to(get_status))
            .route("/refresh", web::post().to(force_refresh))
            .route("/update-gtfs", web::post().to(force_refresh)),
    );
}

// ============================================================================
// Background Task
// ============================================================================

async fn data_refresh_task(store: Arc<FeedStore>, every: Duration) {
    let mut interval = time::interval(every);

    loop {
        // The first tick completes immediately and performs the initial load
        interval.tick().await;

        let store = store.clone();
        match tokio::task::spawn_blocking(move || store.refresh(false)).await {
            Ok(Ok(RefreshOutcome::StillFresh)) => {}
            Ok(Ok(outcome)) => log::info!("✓ GTFS refresh completed ({:?})", outcome),
            Ok(Err(e)) => log::error!("❌ Error updating GTFS data: {}", e),
            Err(e) => log::error!("❌ GTFS refresh task panicked: {}", e),
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(config: Config) -> std::io::Result<()> {
    let timezone = config
        .feed_timezone()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let store = Arc::new(FeedStore::new(
        config.store_config(),
        Arc::new(HttpArchiveSource::new(
            config.static_url.clone(),
            Duration::from_secs(config.download_timeout_secs),
        )),
    ));

    let realtime = CachedRealtimeSource::new(
        HttpRealtimeSource::new(config.realtime_url.clone(), Duration::from_secs(config.request_timeout_secs)),
        Duration::from_secs(config.realtime_cache_secs),
    );

    let app_state = AppState {
        store: store.clone(),
        realtime: Arc::new(realtime),
        defaults: config.query_defaults(),
        policy: config.delay_policy(),
        timezone,
        clock: Utc::now,
    };

    let refresh_every = Duration::from_secs(config.refresh_interval_secs.max(60));
    tokio::spawn(async move {
        data_refresh_task(store, refresh_every).await;
    });

    log::info!("🚀 VBN Info Board Backend running on http://{}:{}", config.host, config.port);
    log::info!("📊 Status: http://localhost:{}/api/status", config.port);
    log::info!("🚌 Departures: http://localhost:{}/api/departures", config.port);
    log::info!("🔄 GTFS refresh every {} minutes", refresh_every.as_secs() / 60);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(configure_routes)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}

fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    actix_web::rt::System::new().block_on(run_server(config))
}
