use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::geometry;
use crate::models::TractRecord;

/// Which bbox query path produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Full,
    Simplified,
    Centroids,
    DirectFallback,
}

#[derive(Debug, Serialize)]
pub struct TractFeature {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub properties: TractProperties,
    pub geometry: Option<Value>,
}

// Canonical property set plus the legacy aliases older map clients still
// read (`GEOID`, `is_lihtc_qct`, `is_oz_designated`).
#[derive(Debug, Serialize)]
pub struct TractProperties {
    pub geoid: String,
    #[serde(rename = "GEOID")]
    pub geoid_alias: String,
    pub state_name: Option<String>,
    pub county_name: Option<String>,
    pub has_any_tax_credit: bool,
    pub is_qct: bool,
    pub is_oz: bool,
    pub is_dda: bool,
    pub is_nmtc_eligible: bool,
    pub is_nmtc_high_migration: bool,
    pub has_state_nmtc: bool,
    pub has_state_lihtc: bool,
    pub severely_distressed: bool,
    pub is_lihtc_qct: bool,
    pub is_oz_designated: bool,
    pub stack_score: i32,
    pub poverty_rate: Option<f64>,
    pub mfi_pct: Option<f64>,
    pub unemployment_rate: Option<f64>,
    pub eligible: bool,
    // JSON-encoded; map renderers only accept scalar property values.
    pub programs: String,
    pub program_count: usize,
}

impl TractFeature {
    /// Wraps a normalized record. With `reduce_to_centroid` the polygon is
    /// collapsed to its representative point; a record whose geometry cannot
    /// be reduced keeps a null geometry rather than failing the batch.
    pub fn from_record(record: TractRecord, reduce_to_centroid: bool) -> Self {
        let geometry = if reduce_to_centroid {
            match record.geometry.as_ref() {
                Some(full) => {
                    let point = geometry::centroid(full);
                    if point.is_none() {
                        warn!(geoid = %record.geoid, "geometry did not reduce to a centroid");
                    }
                    point
                }
                None => None,
            }
        } else {
            record.geometry
        };

        let program_count = record.programs.len();
        let programs =
            serde_json::to_string(&record.programs).unwrap_or_else(|_| "[]".to_string());

        TractFeature {
            kind: "Feature",
            id: record.geoid.clone(),
            properties: TractProperties {
                geoid_alias: record.geoid.clone(),
                geoid: record.geoid,
                state_name: record.state_name,
                county_name: record.county_name,
                has_any_tax_credit: record.has_any_tax_credit,
                is_qct: record.is_qct,
                is_oz: record.is_oz,
                is_dda: record.is_dda,
                is_nmtc_eligible: record.is_nmtc_eligible,
                is_nmtc_high_migration: record.is_nmtc_high_migration,
                has_state_nmtc: record.has_state_nmtc,
                has_state_lihtc: record.has_state_lihtc,
                severely_distressed: record.severely_distressed,
                is_lihtc_qct: record.is_qct,
                is_oz_designated: record.is_oz,
                stack_score: record.stack_score,
                poverty_rate: record.poverty_rate,
                mfi_pct: record.mfi_pct,
                unemployment_rate: record.unemployment_rate,
                eligible: record.has_any_tax_credit,
                programs,
                program_count,
            },
            geometry,
        }
    }
}

/// GeoJSON-style response envelope. Every lookup outcome, including the
/// failure paths, is expressed as one of these.
#[derive(Debug, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub features: Vec<TractFeature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ResponseMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FeatureCollection {
    pub fn new(features: Vec<TractFeature>) -> Self {
        FeatureCollection {
            kind: "FeatureCollection",
            features,
            count: None,
            source: None,
            mode: None,
            error: None,
            message: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_source(mut self, source: &'static str) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_mode(mut self, mode: ResponseMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_count(mut self) -> Self {
        self.count = Some(self.features.len());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
