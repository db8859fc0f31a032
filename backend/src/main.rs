use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use tractmap_tracts::db::postgres::PostgresStore;
use tractmap_tracts::db::{DbError, TractStore};
use tractmap_tracts::feature::{FeatureCollection, ResponseMode, TractFeature};
use tractmap_tracts::models::BoundingBox;
use tractmap_tracts::reference;
use tractmap_tracts::{normalize, normalize_geoid};

#[derive(Debug, Parser)]
struct ServerConfig {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    #[arg(long, env = "BIND_ADDRESS", default_value = "127.0.0.1:8080")]
    bind: String,
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
}

#[derive(Clone)]
struct AppState<S> {
    store: S,
}

#[derive(Debug, Error)]
enum ApiErrorKind {
    #[error("database error: {0}")]
    Database(#[from] DbError),
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl From<ApiErrorKind> for AppError {
    fn from(kind: ApiErrorKind) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: kind.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let config = ServerConfig::parse();
    let bind_addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.bind))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;

    // Warm the offline reference index before accepting traffic.
    let reference = reference::shared().await;
    info!(tracts = reference.len(), "reference dataset ready");

    let state = AppState {
        store: PostgresStore::new(pool),
    };
    let app = create_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind TCP listener")?;

    info!(%bind_addr, "server starting");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;

    Ok(())
}

fn create_router<S: TractStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/api/map/tracts", get(map_tracts::<S>))
        .route("/healthz", get(health_check::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(?err, "failed to listen for CTRL+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(?err, "failed to listen for TERM signal"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

#[derive(Debug, Default, Deserialize)]
struct MapTractsQuery {
    geoid: Option<String>,
    lat: Option<String>,
    lng: Option<String>,
    bbox: Option<String>,
    simplified: Option<String>,
    centroids: Option<String>,
}

#[derive(Debug, PartialEq)]
enum RequestMode {
    ByGeoid(String),
    ByPoint {
        lat: f64,
        lng: f64,
    },
    ByBbox {
        bbox: BoundingBox,
        simplified: bool,
        centroids: bool,
    },
}

#[derive(Debug, PartialEq)]
enum RouteError {
    InvalidCoordinates,
    InvalidBbox,
    MissingParams,
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let body = match self {
            RouteError::InvalidCoordinates => json!({ "error": "Invalid coordinates" }),
            RouteError::InvalidBbox => {
                json!({ "error": "Invalid bbox format. Use: minLng,minLat,maxLng,maxLat" })
            }
            RouteError::MissingParams => json!({
                "error": "Missing required parameter",
                "usage": {
                    "geoid": "/api/map/tracts?geoid=29189010100",
                    "coordinates": "/api/map/tracts?lat=38.6&lng=-90.2",
                    "bbox": "/api/map/tracts?bbox=-90.5,38.5,-89.5,39.5",
                },
            }),
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

// Precedence when several parameter sets arrive together: geoid, then
// lat/lng, then bbox. Empty-string parameters count as absent.
fn route_request(params: &MapTractsQuery) -> std::result::Result<RequestMode, RouteError> {
    if let Some(geoid) = params.geoid.as_deref().filter(|g| !g.is_empty()) {
        return Ok(RequestMode::ByGeoid(normalize_geoid(geoid)));
    }

    let lat = params.lat.as_deref().filter(|v| !v.is_empty());
    let lng = params.lng.as_deref().filter(|v| !v.is_empty());
    if let (Some(lat), Some(lng)) = (lat, lng) {
        let lat = parse_finite(lat).ok_or(RouteError::InvalidCoordinates)?;
        let lng = parse_finite(lng).ok_or(RouteError::InvalidCoordinates)?;
        return Ok(RequestMode::ByPoint { lat, lng });
    }

    if let Some(raw) = params.bbox.as_deref().filter(|v| !v.is_empty()) {
        let bbox = BoundingBox::parse(raw).ok_or(RouteError::InvalidBbox)?;
        return Ok(RequestMode::ByBbox {
            bbox,
            simplified: flag_set(&params.simplified),
            centroids: flag_set(&params.centroids),
        });
    }

    Err(RouteError::MissingParams)
}

fn parse_finite(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    value.is_finite().then_some(value)
}

fn flag_set(value: &Option<String>) -> bool {
    value.as_deref() == Some("true")
}

/// The single map-tract read endpoint. Malformed input is the only thing
/// that produces a non-200 status; "no data" always comes back as a
/// well-formed feature collection with an informational marker.
async fn map_tracts<S: TractStore>(
    State(state): State<AppState<S>>,
    Query(params): Query<MapTractsQuery>,
) -> Response {
    let mode = match route_request(&params) {
        Ok(mode) => mode,
        Err(err) => return err.into_response(),
    };

    match mode {
        RequestMode::ByGeoid(geoid) => lookup_by_geoid(&state.store, &geoid).await,
        RequestMode::ByPoint { lat, lng } => lookup_by_point(&state.store, lat, lng).await,
        RequestMode::ByBbox {
            bbox,
            simplified,
            centroids,
        } => lookup_by_bbox(&state.store, bbox, simplified, centroids).await,
    }
}

async fn lookup_by_geoid<S: TractStore>(store: &S, geoid: &str) -> Response {
    let result = match store.tract_by_geoid(geoid).await {
        Ok(result) => result,
        Err(err) => {
            error!(%geoid, error = %err, "tract lookup failed");
            return Json(FeatureCollection::empty().with_error("Tract not found")).into_response();
        }
    };

    match result.rows.into_iter().next() {
        None => Json(FeatureCollection::empty().with_error("Tract not found")).into_response(),
        Some(row) => {
            let feature = TractFeature::from_record(normalize(row), false);
            Json(FeatureCollection::new(vec![feature]).with_source(result.source)).into_response()
        }
    }
}

async fn lookup_by_point<S: TractStore>(store: &S, lat: f64, lng: f64) -> Response {
    let result = match store.tract_at_point(lat, lng).await {
        Ok(result) => result,
        Err(err) => {
            // No fallback for point-in-polygon: report the failure instead
            // of guessing a tract.
            warn!(lat, lng, error = %err, "point lookup failed");
            return Json(FeatureCollection::empty().with_error("Point-in-polygon lookup failed"))
                .into_response();
        }
    };

    match result.rows.into_iter().next() {
        None => Json(FeatureCollection::empty().with_message("No tract found at coordinates"))
            .into_response(),
        Some(row) => {
            let feature = TractFeature::from_record(normalize(row), false);
            Json(FeatureCollection::new(vec![feature]).with_source(result.source)).into_response()
        }
    }
}

async fn lookup_by_bbox<S: TractStore>(
    store: &S,
    bbox: BoundingBox,
    simplified: bool,
    centroids: bool,
) -> Response {
    let result = match store.tracts_in_bbox(bbox, simplified).await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "bbox query failed");
            return Json(FeatureCollection::empty().with_error("Query failed")).into_response();
        }
    };

    // The unfiltered fallback keeps full geometry; centroid reduction only
    // applies on the spatial path.
    let reduce = centroids && !result.fallback;
    let mode = if result.fallback {
        ResponseMode::DirectFallback
    } else if centroids {
        ResponseMode::Centroids
    } else if simplified {
        ResponseMode::Simplified
    } else {
        ResponseMode::Full
    };

    let features: Vec<TractFeature> = result
        .rows
        .into_iter()
        .map(|row| TractFeature::from_record(normalize(row), reduce))
        .collect();

    Json(
        FeatureCollection::new(features)
            .with_count()
            .with_source(result.source)
            .with_mode(mode),
    )
    .into_response()
}

async fn health_check<S: TractStore>(State(state): State<AppState<S>>) -> ApiResult<Json<Value>> {
    state.store.health_check().await.map_err(ApiErrorKind::from)?;
    Ok(Json(json!({ "status": "ok" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use tractmap_tracts::db::TractRows;
    use tractmap_tracts::models::TractRow;

    // In-memory stand-in for the live store. With `spatial: false` it
    // behaves like a backend missing the stored functions: geoid and bbox
    // lookups serve from the direct path, point lookups error.
    #[derive(Clone)]
    struct MemoryStore {
        rows: Vec<TractRow>,
        spatial: bool,
    }

    #[async_trait]
    impl TractStore for MemoryStore {
        async fn tract_by_geoid(&self, geoid: &str) -> Result<TractRows, DbError> {
            let rows: Vec<TractRow> = self
                .rows
                .iter()
                .filter(|row| row.geoid == geoid)
                .cloned()
                .collect();
            Ok(if self.spatial {
                TractRows {
                    rows,
                    source: "get_tract_with_credits",
                    fallback: false,
                }
            } else {
                TractRows {
                    rows,
                    source: "tract_map_layer",
                    fallback: true,
                }
            })
        }

        async fn tract_at_point(&self, _lat: f64, _lng: f64) -> Result<TractRows, DbError> {
            if !self.spatial {
                return Err(DbError::Database(
                    "function get_tract_at_point does not exist".to_string(),
                ));
            }
            Ok(TractRows {
                rows: self.rows.first().cloned().into_iter().collect(),
                source: "get_tract_at_point",
                fallback: false,
            })
        }

        async fn tracts_in_bbox(
            &self,
            _bbox: BoundingBox,
            simplified: bool,
        ) -> Result<TractRows, DbError> {
            Ok(if self.spatial {
                TractRows {
                    rows: self.rows.clone(),
                    source: if simplified {
                        "get_simplified_tracts_in_bbox"
                    } else {
                        "get_map_tracts_in_bbox"
                    },
                    fallback: false,
                }
            } else {
                TractRows {
                    rows: self.rows.clone(),
                    source: "tract_map_layer",
                    fallback: true,
                }
            })
        }

        async fn health_check(&self) -> Result<(), DbError> {
            Ok(())
        }
    }

    fn polygon_json() -> String {
        json!({
            "type": "Polygon",
            "coordinates": [[
                [-90.0, 38.0],
                [-89.0, 38.0],
                [-89.0, 39.0],
                [-90.0, 39.0],
            ]],
        })
        .to_string()
    }

    fn sample_rows() -> Vec<TractRow> {
        vec![
            TractRow {
                geoid: "29189010100".to_string(),
                is_qct: Some(true),
                is_dda: Some(true),
                geom_json: Some(polygon_json()),
                ..TractRow::default()
            },
            // legacy-shape row
            TractRow {
                geoid: "17031010100".to_string(),
                is_lihtc_qct: Some(false),
                is_oz_designated: Some(true),
                geom_json: Some(polygon_json()),
                ..TractRow::default()
            },
        ]
    }

    fn store(spatial: bool) -> MemoryStore {
        MemoryStore {
            rows: sample_rows(),
            spatial,
        }
    }

    async fn get_json(store: MemoryStore, uri: &str) -> (StatusCode, Value) {
        let app = create_router(AppState { store });
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn geoid_takes_precedence_over_point_and_bbox() {
        let params = MapTractsQuery {
            geoid: Some("17031-010100".to_string()),
            lat: Some("38.6".to_string()),
            lng: Some("-90.2".to_string()),
            bbox: Some("-90.5,38.5,-89.5,39.5".to_string()),
            ..MapTractsQuery::default()
        };
        assert_eq!(
            route_request(&params),
            Ok(RequestMode::ByGeoid("17031010100".to_string()))
        );
    }

    #[test]
    fn point_takes_precedence_over_bbox() {
        let params = MapTractsQuery {
            lat: Some("38.6".to_string()),
            lng: Some("-90.2".to_string()),
            bbox: Some("-90.5,38.5,-89.5,39.5".to_string()),
            ..MapTractsQuery::default()
        };
        assert_eq!(
            route_request(&params),
            Ok(RequestMode::ByPoint {
                lat: 38.6,
                lng: -90.2
            })
        );
    }

    #[test]
    fn lone_lat_is_not_a_point_request() {
        let params = MapTractsQuery {
            lat: Some("38.6".to_string()),
            ..MapTractsQuery::default()
        };
        assert_eq!(route_request(&params), Err(RouteError::MissingParams));
    }

    #[tokio::test]
    async fn no_params_is_a_400_with_usage() {
        let (status, body) = get_json(store(true), "/api/map/tracts").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required parameter");
        assert!(body["usage"]["bbox"].is_string());
        assert!(body["usage"]["geoid"].is_string());
        assert!(body["usage"]["coordinates"].is_string());
    }

    #[tokio::test]
    async fn unparseable_coordinates_are_rejected() {
        let (status, body) = get_json(store(true), "/api/map/tracts?lat=abc&lng=-90.2").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid coordinates");
    }

    #[tokio::test]
    async fn malformed_bbox_is_rejected() {
        let (status, body) = get_json(store(true), "/api/map/tracts?bbox=abc,1,2,3").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            "Invalid bbox format. Use: minLng,minLat,maxLng,maxLat"
        );
    }

    #[tokio::test]
    async fn geoid_lookup_returns_one_feature() {
        let (status, body) = get_json(store(true), "/api/map/tracts?geoid=29189-010100").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "FeatureCollection");
        assert_eq!(body["features"].as_array().unwrap().len(), 1);
        assert_eq!(body["features"][0]["id"], "29189010100");
        assert_eq!(body["source"], "get_tract_with_credits");
        assert_eq!(
            body["features"][0]["properties"]["programs"],
            r#"["LIHTC QCT","DDA (30% Boost)"]"#
        );
    }

    #[tokio::test]
    async fn unknown_geoid_is_empty_collection_not_an_error_status() {
        let (status, body) = get_json(store(true), "/api/map/tracts?geoid=99999999999").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["features"].as_array().unwrap().len(), 0);
        assert_eq!(body["error"], "Tract not found");
    }

    #[tokio::test]
    async fn geoid_lookup_survives_missing_spatial_function() {
        let (status, body) = get_json(store(false), "/api/map/tracts?geoid=29189010100").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["features"].as_array().unwrap().len(), 1);
        assert_eq!(body["source"], "tract_map_layer");
    }

    #[tokio::test]
    async fn point_lookup_failure_is_marked_not_guessed() {
        let (status, body) = get_json(store(false), "/api/map/tracts?lat=38.6&lng=-90.2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["features"].as_array().unwrap().len(), 0);
        assert_eq!(body["error"], "Point-in-polygon lookup failed");
    }

    #[tokio::test]
    async fn point_miss_carries_a_message() {
        let empty = MemoryStore {
            rows: Vec::new(),
            spatial: true,
        };
        let (status, body) = get_json(empty, "/api/map/tracts?lat=38.6&lng=-90.2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "No tract found at coordinates");
    }

    #[tokio::test]
    async fn bbox_returns_full_mode_with_count() {
        let (status, body) =
            get_json(store(true), "/api/map/tracts?bbox=-90.5,38.5,-89.5,39.5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "full");
        assert_eq!(body["count"], 2);
        assert_eq!(body["source"], "get_map_tracts_in_bbox");
        assert_eq!(body["features"][0]["geometry"]["type"], "Polygon");
    }

    #[tokio::test]
    async fn simplified_bbox_uses_the_simplified_function() {
        let (status, body) = get_json(
            store(true),
            "/api/map/tracts?bbox=-90.5,38.5,-89.5,39.5&simplified=true",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "simplified");
        assert_eq!(body["source"], "get_simplified_tracts_in_bbox");
    }

    #[tokio::test]
    async fn centroid_mode_returns_points_with_same_eligibility() {
        let (_, full) = get_json(store(true), "/api/map/tracts?bbox=-90.5,38.5,-89.5,39.5").await;
        let (status, reduced) = get_json(
            store(true),
            "/api/map/tracts?bbox=-90.5,38.5,-89.5,39.5&centroids=true",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(reduced["mode"], "centroids");
        for (full_feature, point_feature) in full["features"]
            .as_array()
            .unwrap()
            .iter()
            .zip(reduced["features"].as_array().unwrap())
        {
            assert_eq!(point_feature["geometry"]["type"], "Point");
            assert_eq!(
                point_feature["properties"]["has_any_tax_credit"],
                full_feature["properties"]["has_any_tax_credit"]
            );
        }
    }

    #[tokio::test]
    async fn bbox_fallback_is_flagged_as_direct_fallback() {
        let (status, body) =
            get_json(store(false), "/api/map/tracts?bbox=-90.5,38.5,-89.5,39.5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "direct_fallback");
        assert_eq!(body["source"], "tract_map_layer");
        // the unfiltered scan returns everything with full geometry
        assert_eq!(body["count"], 2);
        assert_eq!(body["features"][0]["geometry"]["type"], "Polygon");
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (status, body) = get_json(store(true), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
