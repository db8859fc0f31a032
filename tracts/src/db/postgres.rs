use async_trait::async_trait;
use sqlx::PgPool;
use tracing::warn;

use crate::db::{DbError, TractRows, TractStore};
use crate::models::{BoundingBox, TractRow};

// Consolidated view joining tract geometries with the master tax-credit
// table; the direct queries and the provenance marker both use it.
const MAP_LAYER: &str = "tract_map_layer";

/// Live tract store backed by Postgres. Each lookup tries the pre-indexed
/// spatial function first and degrades to a direct query against the
/// consolidated view when that function errors or is missing. Exactly one
/// fallback attempt, never a retry loop.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn direct_geoid_query(&self, geoid: &str) -> Result<TractRows, DbError> {
        let row: Option<TractRow> =
            sqlx::query_as(&format!("SELECT * FROM {MAP_LAYER} WHERE geoid = $1"))
                .bind(geoid)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DbError::Database(e.to_string()))?;

        Ok(TractRows {
            rows: row.into_iter().collect(),
            source: MAP_LAYER,
            fallback: true,
        })
    }

    // No spatial filtering here: the whole table comes back. Bounded by the
    // national tract count, and the caller flags the response so clients can
    // re-filter.
    async fn direct_bbox_scan(&self) -> Result<TractRows, DbError> {
        let rows: Vec<TractRow> = sqlx::query_as(&format!("SELECT * FROM {MAP_LAYER}"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::Database(e.to_string()))?;

        Ok(TractRows {
            rows,
            source: MAP_LAYER,
            fallback: true,
        })
    }
}

#[async_trait]
impl TractStore for PostgresStore {
    async fn tract_by_geoid(&self, geoid: &str) -> Result<TractRows, DbError> {
        let attempt: Result<Vec<TractRow>, sqlx::Error> =
            sqlx::query_as("SELECT * FROM get_tract_with_credits($1)")
                .bind(geoid)
                .fetch_all(&self.pool)
                .await;

        match attempt {
            Ok(rows) => Ok(TractRows {
                rows,
                source: "get_tract_with_credits",
                fallback: false,
            }),
            Err(err) => {
                warn!(%geoid, error = %err, "get_tract_with_credits failed, using direct query");
                self.direct_geoid_query(geoid).await
            }
        }
    }

    async fn tract_at_point(&self, lat: f64, lng: f64) -> Result<TractRows, DbError> {
        let rows: Vec<TractRow> = sqlx::query_as("SELECT * FROM get_tract_at_point($1, $2)")
            .bind(lat)
            .bind(lng)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::Database(e.to_string()))?;

        Ok(TractRows {
            rows,
            source: "get_tract_at_point",
            fallback: false,
        })
    }

    async fn tracts_in_bbox(
        &self,
        bbox: BoundingBox,
        simplified: bool,
    ) -> Result<TractRows, DbError> {
        // The simplified variant returns reduced geometry for zoomed-out
        // viewports.
        let function = if simplified {
            "get_simplified_tracts_in_bbox"
        } else {
            "get_map_tracts_in_bbox"
        };

        let attempt: Result<Vec<TractRow>, sqlx::Error> =
            sqlx::query_as(&format!("SELECT * FROM {function}($1, $2, $3, $4)"))
                .bind(bbox.min_lng)
                .bind(bbox.min_lat)
                .bind(bbox.max_lng)
                .bind(bbox.max_lat)
                .fetch_all(&self.pool)
                .await;

        match attempt {
            Ok(rows) => Ok(TractRows {
                rows,
                source: function,
                fallback: false,
            }),
            Err(err) => {
                warn!(%function, error = %err, "spatial bbox query failed, scanning whole table");
                self.direct_bbox_scan().await
            }
        }
    }

    async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::Database(e.to_string()))?;
        Ok(())
    }
}
