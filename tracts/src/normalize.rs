use serde_json::Value;
use tracing::warn;

use crate::models::{TractRecord, TractRow};

/// Collapses a raw row of either schema generation into the canonical
/// record. Field precedence: current column, then the mapped legacy column,
/// then `false`/`None`.
///
/// Legacy mapping: `is_lihtc_qct` -> `is_qct`, `is_oz_designated` -> `is_oz`,
/// `severely_distressed` -> `is_nmtc_eligible`,
/// `median_family_income_pct` -> `mfi_pct`.
pub fn normalize(row: TractRow) -> TractRecord {
    let is_qct = row.is_qct.or(row.is_lihtc_qct).unwrap_or(false);
    let is_oz = row.is_oz.or(row.is_oz_designated).unwrap_or(false);
    let is_dda = row.is_dda.unwrap_or(false);
    let is_nmtc_eligible = row
        .is_nmtc_eligible
        .or(row.severely_distressed)
        .unwrap_or(false);
    let is_nmtc_high_migration = row.is_nmtc_high_migration.unwrap_or(false);
    let has_state_nmtc = row.has_state_nmtc.unwrap_or(false);
    let has_state_lihtc = row.has_state_lihtc.unwrap_or(false);
    let mfi_pct = row.mfi_pct.or(row.median_family_income_pct);

    // Federal programs only. State programs are bonuses, and DDA is a 30%
    // basis boost on top of a QCT designation, never a qualifier by itself.
    let has_any_tax_credit = row
        .has_any_tax_credit
        .unwrap_or(is_qct || is_oz || is_nmtc_eligible || is_nmtc_high_migration);

    let programs = build_programs(
        is_nmtc_eligible,
        has_state_nmtc,
        is_qct,
        is_dda,
        is_oz,
    );

    let geometry = row.geom_json.as_deref().and_then(|raw| parse_geometry(&row.geoid, raw));

    TractRecord {
        stack_score: row.stack_score.unwrap_or(programs.len() as i32),
        geoid: row.geoid,
        state_name: row.state_name,
        county_name: row.county_name,
        is_qct,
        is_oz,
        is_dda,
        is_nmtc_eligible,
        is_nmtc_high_migration,
        has_state_nmtc,
        has_state_lihtc,
        severely_distressed: row.severely_distressed.unwrap_or(false),
        has_any_tax_credit,
        poverty_rate: row.poverty_rate,
        mfi_pct,
        unemployment_rate: row.unemployment_rate,
        programs,
        geometry,
    }
}

// Label order is the display order in the map client. State NMTC rides
// directly behind Federal NMTC, and the DDA boost directly behind its QCT.
// No HTC or Brownfield labels: eligibility for those is not computed here.
fn build_programs(
    is_nmtc_eligible: bool,
    has_state_nmtc: bool,
    is_qct: bool,
    is_dda: bool,
    is_oz: bool,
) -> Vec<String> {
    let mut programs = Vec::new();

    if is_nmtc_eligible {
        programs.push("Federal NMTC".to_string());
        if has_state_nmtc {
            programs.push("State NMTC".to_string());
        }
    }

    if is_qct {
        programs.push("LIHTC QCT".to_string());
        if is_dda {
            programs.push("DDA (30% Boost)".to_string());
        }
    }

    if is_oz {
        programs.push("Opportunity Zone".to_string());
    }

    programs
}

fn parse_geometry(geoid: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%geoid, error = %err, "discarding unparseable geom_json");
            None
        }
    }
}
