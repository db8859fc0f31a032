pub mod states;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::models::normalize_geoid;

/// Offline NMTC eligibility dataset, keyed by GEOID. Only tracts that pass
/// the low-income-community test are present: a missing key means "not in
/// the eligible set", not "unknown tract".
///
/// Loaded once per process behind a single-flight guard; immutable after.
pub struct ReferenceIndex {
    tracts: BTreeMap<String, RawTract>,
}

// On-disk row shape:
// [state_abbr, county, poverty, income, unemployment, poverty_q, income_q, class_letter]
#[derive(Debug, Clone, Deserialize)]
struct RawTract(String, String, f64, f64, f64, u8, u8, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Classification {
    Neither,
    Sellable,
    Refundable,
    Both,
}

impl Classification {
    fn from_letter(letter: &str) -> Self {
        match letter {
            "S" => Classification::Sellable,
            "R" => Classification::Refundable,
            "B" => Classification::Both,
            _ => Classification::Neither,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Neither => "Neither",
            Classification::Sellable => "Sellable",
            Classification::Refundable => "Refundable",
            Classification::Both => "Both",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceTract {
    pub geoid: String,
    pub state: String,
    pub state_abbr: String,
    pub county: String,
    pub poverty: f64,
    pub income: f64,
    pub unemployment: f64,
    pub poverty_qualifies: bool,
    pub income_qualifies: bool,
    /// Always true: presence in the dataset is the eligibility test.
    pub eligible: bool,
    pub severely_distressed: bool,
    pub classification: Classification,
}

#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub min_poverty: Option<f64>,
    pub max_poverty: Option<f64>,
    pub min_income: Option<f64>,
    pub max_income: Option<f64>,
    pub severely_distressed: Option<bool>,
    pub classification: Option<Classification>,
    pub limit: Option<usize>,
}

const DEFAULT_SEARCH_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceStats {
    pub total_eligible: usize,
    pub by_state: BTreeMap<String, usize>,
    pub by_classification: BTreeMap<&'static str, usize>,
    pub severely_distressed: usize,
}

static SHARED: OnceCell<ReferenceIndex> = OnceCell::const_new();

/// Process-wide index. Concurrent first callers all await the same load;
/// later callers get the built index without locking.
pub async fn shared() -> &'static ReferenceIndex {
    SHARED
        .get_or_init(|| async {
            let path = std::env::var("TRACT_DATA_PATH")
                .unwrap_or_else(|_| "data/tract_eligible.json".to_string());
            ReferenceIndex::load(Path::new(&path)).await
        })
        .await
}

impl ReferenceIndex {
    pub fn empty() -> Self {
        Self {
            tracts: BTreeMap::new(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let tracts: BTreeMap<String, RawTract> = serde_json::from_str(raw)?;
        Ok(Self { tracts })
    }

    /// Reads the dataset from disk. A missing or unparseable file loads an
    /// empty index: every lookup then reports "absent" rather than erroring.
    pub async fn load(path: &Path) -> Self {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "reference dataset unavailable");
                return Self::empty();
            }
        };

        match Self::from_json(&raw) {
            Ok(index) => {
                info!(tracts = index.len(), "loaded reference dataset");
                index
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "reference dataset unparseable");
                Self::empty()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracts.is_empty()
    }

    /// Single lookup. `None` means the tract is not in the eligible set.
    pub fn lookup(&self, geoid: &str) -> Option<ReferenceTract> {
        let key = normalize_geoid(geoid);
        self.tracts.get(&key).map(|raw| parse_raw(&key, raw))
    }

    /// Batch lookup; GEOIDs absent from the index are silently dropped.
    pub fn lookup_batch<'a, I>(&self, geoids: I) -> BTreeMap<String, ReferenceTract>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut found = BTreeMap::new();
        for geoid in geoids {
            let key = normalize_geoid(geoid);
            if let Some(raw) = self.tracts.get(&key) {
                found.insert(key.clone(), parse_raw(&key, raw));
            }
        }
        found
    }

    /// All tracts for a state, accepted as a 2-digit FIPS code or a postal
    /// abbreviation. Unknown codes yield an empty list.
    pub fn by_state(&self, state: &str) -> Vec<ReferenceTract> {
        let abbr = if state.len() == 2 && state.chars().all(|c| c.is_ascii_digit()) {
            match states::abbr_for_fips(state) {
                Some(abbr) => abbr.to_string(),
                None => return Vec::new(),
            }
        } else {
            state.to_ascii_uppercase()
        };

        self.tracts
            .iter()
            .filter(|(_, raw)| raw.0 == abbr)
            .map(|(geoid, raw)| parse_raw(geoid, raw))
            .collect()
    }

    /// Case-insensitive substring match on county name within a state.
    pub fn by_county(&self, state_abbr: &str, county: &str) -> Vec<ReferenceTract> {
        let abbr = state_abbr.to_ascii_uppercase();
        let needle = county.trim().to_lowercase();

        self.tracts
            .iter()
            .filter(|(_, raw)| raw.0 == abbr && raw.1.to_lowercase().contains(&needle))
            .map(|(geoid, raw)| parse_raw(geoid, raw))
            .collect()
    }

    /// Criteria search, short-circuiting once `limit` rows are collected.
    /// Iteration is in ascending GEOID order, so the truncated result set is
    /// deterministic.
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<ReferenceTract> {
        let limit = criteria.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let mut results = Vec::new();

        for (geoid, raw) in &self.tracts {
            if results.len() >= limit {
                break;
            }

            let tract = parse_raw(geoid, raw);
            if criteria.min_poverty.is_some_and(|min| tract.poverty < min) {
                continue;
            }
            if criteria.max_poverty.is_some_and(|max| tract.poverty > max) {
                continue;
            }
            if criteria.min_income.is_some_and(|min| tract.income < min) {
                continue;
            }
            if criteria.max_income.is_some_and(|max| tract.income > max) {
                continue;
            }
            if criteria
                .severely_distressed
                .is_some_and(|want| tract.severely_distressed != want)
            {
                continue;
            }
            if criteria
                .classification
                .is_some_and(|want| tract.classification != want)
            {
                continue;
            }

            results.push(tract);
        }

        results
    }

    pub fn stats(&self) -> ReferenceStats {
        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_classification: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut severely_distressed = 0;

        for (geoid, raw) in &self.tracts {
            let tract = parse_raw(geoid, raw);
            *by_state.entry(tract.state_abbr).or_default() += 1;
            *by_classification
                .entry(tract.classification.as_str())
                .or_default() += 1;
            if tract.severely_distressed {
                severely_distressed += 1;
            }
        }

        ReferenceStats {
            total_eligible: self.tracts.len(),
            by_state,
            by_classification,
            severely_distressed,
        }
    }
}

fn parse_raw(geoid: &str, raw: &RawTract) -> ReferenceTract {
    let RawTract(state_abbr, county, poverty, income, unemployment, poverty_q, income_q, letter) =
        raw;

    let poverty_qualifies = *poverty_q == 1;
    let income_qualifies = *income_q == 1;

    ReferenceTract {
        geoid: geoid.to_string(),
        state: states::name_for_abbr(state_abbr)
            .map(str::to_string)
            .unwrap_or_else(|| state_abbr.clone()),
        state_abbr: state_abbr.clone(),
        county: county.clone(),
        poverty: *poverty,
        income: *income,
        unemployment: *unemployment,
        poverty_qualifies,
        income_qualifies,
        eligible: true,
        severely_distressed: *poverty >= 30.0
            || (poverty_qualifies && income_qualifies && *unemployment >= 10.0),
        classification: Classification::from_letter(letter),
    }
}
