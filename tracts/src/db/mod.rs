pub mod postgres;

use async_trait::async_trait;

use crate::models::{BoundingBox, TractRow};

/// Rows plus the provenance the response envelope reports.
#[derive(Debug, Clone)]
pub struct TractRows {
    pub rows: Vec<TractRow>,
    /// Relation or stored function that served the rows.
    pub source: &'static str,
    /// True when the rows came from the direct, non-spatial path.
    pub fallback: bool,
}

#[async_trait]
pub trait TractStore: Clone + Send + Sync + 'static {
    /// Exact-match lookup. The GEOID must already be normalized.
    async fn tract_by_geoid(&self, geoid: &str) -> Result<TractRows, DbError>;

    /// Point-in-polygon lookup. Has no fallback path: a failure here is
    /// surfaced to the caller instead of guessing.
    async fn tract_at_point(&self, lat: f64, lng: f64) -> Result<TractRows, DbError>;

    /// Bounding-box intersection. The fallback path returns the whole
    /// table unfiltered and marks the result accordingly.
    async fn tracts_in_bbox(
        &self,
        bbox: BoundingBox,
        simplified: bool,
    ) -> Result<TractRows, DbError>;

    async fn health_check(&self) -> Result<(), DbError>;
}

#[derive(Debug)]
pub enum DbError {
    Database(String),
    Internal(String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Database(msg) => write!(f, "Database error: {}", msg),
            DbError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for DbError {}
