use serde::{Deserialize, Serialize};
use serde_json::Value;

// A raw row from the backing store. Two generations of the schema are in
// circulation: the consolidated `tract_map_layer` view uses the current
// column names, while the older stored functions still emit the legacy
// ones. Every column except `geoid` is optional so a row of either shape
// deserializes cleanly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct TractRow {
    pub geoid: String,
    #[sqlx(default)]
    pub geom_json: Option<String>,
    // current column names
    #[sqlx(default)]
    pub has_any_tax_credit: Option<bool>,
    #[sqlx(default)]
    pub is_qct: Option<bool>,
    #[sqlx(default)]
    pub is_oz: Option<bool>,
    #[sqlx(default)]
    pub is_dda: Option<bool>,
    #[sqlx(default)]
    pub is_nmtc_eligible: Option<bool>,
    #[sqlx(default)]
    pub is_nmtc_high_migration: Option<bool>,
    // legacy column names
    #[sqlx(default)]
    pub is_lihtc_qct: Option<bool>,
    #[sqlx(default)]
    pub is_oz_designated: Option<bool>,
    #[sqlx(default)]
    pub severely_distressed: Option<bool>,
    #[sqlx(default)]
    pub median_family_income_pct: Option<f64>,
    // columns shared by both generations
    #[sqlx(default)]
    pub state_name: Option<String>,
    #[sqlx(default)]
    pub county_name: Option<String>,
    #[sqlx(default)]
    pub has_state_nmtc: Option<bool>,
    #[sqlx(default)]
    pub has_state_lihtc: Option<bool>,
    #[sqlx(default)]
    pub stack_score: Option<i32>,
    #[sqlx(default)]
    pub poverty_rate: Option<f64>,
    #[sqlx(default)]
    pub mfi_pct: Option<f64>,
    #[sqlx(default)]
    pub unemployment_rate: Option<f64>,
}

/// Canonical tract record after schema normalization. Callers never see the
/// legacy column names again past this point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TractRecord {
    pub geoid: String,
    pub state_name: Option<String>,
    pub county_name: Option<String>,
    pub is_qct: bool,
    pub is_oz: bool,
    pub is_dda: bool,
    pub is_nmtc_eligible: bool,
    pub is_nmtc_high_migration: bool,
    pub has_state_nmtc: bool,
    pub has_state_lihtc: bool,
    pub severely_distressed: bool,
    pub has_any_tax_credit: bool,
    pub stack_score: i32,
    pub poverty_rate: Option<f64>,
    pub mfi_pct: Option<f64>,
    pub unemployment_rate: Option<f64>,
    /// Ordered program labels; the order is part of the API contract.
    pub programs: Vec<String>,
    /// GeoJSON geometry parsed from the store's `geom_json` column.
    pub geometry: Option<Value>,
}

/// Canonical 11-character GEOID: dashes and whitespace stripped, zero-padded
/// on the left.
pub fn normalize_geoid(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect();
    format!("{cleaned:0>11}")
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Parses `minLng,minLat,maxLng,maxLat`. All four components must be
    /// finite numbers.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(',');
        let mut next = || -> Option<f64> {
            let value: f64 = parts.next()?.trim().parse().ok()?;
            value.is_finite().then_some(value)
        };

        let bbox = BoundingBox {
            min_lng: next()?,
            min_lat: next()?,
            max_lng: next()?,
            max_lat: next()?,
        };

        if parts.next().is_some() {
            return None;
        }

        Some(bbox)
    }
}
