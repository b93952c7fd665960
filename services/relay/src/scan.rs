//! Scan engine: filtered, sorted, paginated views of the pattern cache
//! with a read-through response cache.

use crate::pattern_cache::{keys, CacheError, PatternCache};
use crate::unix_now;
use md5::{Digest, Md5};
use relay_protocol::{CacheInfo, Pagination, PatternRecord, ScanResponse};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Wall-clock budget for one scan; exceeding it returns partial results
/// with a warning flag.
const SCAN_BUDGET: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Confidence,
    DetectedAt,
    Symbol,
    Rs,
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Scan filter schema.  All fields optional on the wire; unknown fields
/// are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFilters {
    #[serde(default)]
    pub pattern_types: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_confidence_min")]
    pub confidence_min: f64,
    #[serde(default)]
    pub rs_min: f64,
    #[serde(default)]
    pub vol_min: f64,
    #[serde(default = "default_rsi_range")]
    pub rsi_range: [f64; 2],
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_confidence_min() -> f64 {
    0.5
}

fn default_rsi_range() -> [f64; 2] {
    [0.0, 100.0]
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    30
}

impl Default for ScanFilters {
    fn default() -> Self {
        ScanFilters {
            pattern_types: Vec::new(),
            symbols: Vec::new(),
            confidence_min: default_confidence_min(),
            rs_min: 0.0,
            vol_min: 0.0,
            rsi_range: default_rsi_range(),
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl ScanFilters {
    /// Build filters from flat query params.  List values are
    /// comma-separated; unknown params are ignored; malformed values are
    /// contract errors.
    pub fn from_query_pairs<'a, I>(pairs: I) -> Result<Self, ScanError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        fn num(name: &str, value: &str) -> Result<f64, ScanError> {
            value
                .parse()
                .map_err(|_| ScanError::Contract(format!("invalid number for {name}: {value}")))
        }
        fn int(name: &str, value: &str) -> Result<u32, ScanError> {
            value
                .parse()
                .map_err(|_| ScanError::Contract(format!("invalid integer for {name}: {value}")))
        }
        fn list(value: &str) -> Vec<String> {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        }

        let mut filters = ScanFilters::default();
        for (key, value) in pairs {
            match key {
                "pattern_types" => filters.pattern_types = list(value),
                "symbols" => filters.symbols = list(value),
                "confidence_min" => filters.confidence_min = num(key, value)?,
                "rs_min" => filters.rs_min = num(key, value)?,
                "vol_min" => filters.vol_min = num(key, value)?,
                "rsi_min" => filters.rsi_range[0] = num(key, value)?,
                "rsi_max" => filters.rsi_range[1] = num(key, value)?,
                "rsi_range" => {
                    let parts: Vec<&str> = value.split(',').collect();
                    if parts.len() != 2 {
                        return Err(ScanError::Contract(format!(
                            "rsi_range must be lo,hi: {value}"
                        )));
                    }
                    filters.rsi_range = [num(key, parts[0])?, num(key, parts[1])?];
                }
                "sort_by" => {
                    filters.sort_by = match value {
                        "confidence" => SortBy::Confidence,
                        "detected_at" => SortBy::DetectedAt,
                        "symbol" => SortBy::Symbol,
                        "rs" => SortBy::Rs,
                        "volume" => SortBy::Volume,
                        other => {
                            return Err(ScanError::Contract(format!("invalid sort_by: {other}")))
                        }
                    };
                }
                "sort_order" => {
                    filters.sort_order = match value {
                        "asc" => SortOrder::Asc,
                        "desc" => SortOrder::Desc,
                        other => {
                            return Err(ScanError::Contract(format!("invalid sort_order: {other}")))
                        }
                    };
                }
                "page" => filters.page = int(key, value)?,
                "per_page" => filters.per_page = int(key, value)?,
                // Unknown filters are ignored per contract.
                _ => {}
            }
        }
        Ok(filters)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.page < 1 {
            return Err(ScanError::Contract("page must be >= 1".to_owned()));
        }
        if self.per_page < 1 || self.per_page > 100 {
            return Err(ScanError::Contract(
                "per_page must be between 1 and 100".to_owned(),
            ));
        }
        Ok(())
    }

    /// Stable hash of the normalized filters; the response-cache key.
    pub fn cache_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Md5::digest(canonical.as_bytes());
        format!("{digest:x}")
    }

    /// Residual filters applied after the index walk.
    fn admits(&self, record: &PatternRecord, now: f64) -> bool {
        if !self.pattern_types.is_empty()
            && !self.pattern_types.iter().any(|p| *p == record.pattern_type)
        {
            return false;
        }
        if !self.symbols.is_empty() && !self.symbols.iter().any(|s| *s == record.symbol) {
            return false;
        }
        if record.relative_strength() < self.rs_min {
            return false;
        }
        if record.relative_volume() < self.vol_min {
            return false;
        }
        let rsi = record.rsi();
        if rsi < self.rsi_range[0] || rsi > self.rsi_range[1] {
            return false;
        }
        // Visible only while still valid.
        record.expires_at > now
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Invalid filter values; the cache is never touched.
    #[error("invalid scan filters: {0}")]
    Contract(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ScanEngine {
    cache: Arc<PatternCache>,
}

impl ScanEngine {
    pub fn new(cache: Arc<PatternCache>) -> Self {
        ScanEngine { cache }
    }

    /// Serve one scan: response cache first, then an index walk with
    /// residual filtering, sorting, and pagination.
    pub async fn scan(&self, filters: &ScanFilters) -> Result<ScanResponse, ScanError> {
        filters.validate()?;
        let started = Instant::now();

        let cache_key = keys::scan_response(&filters.cache_hash());
        if let Some(body) = self.cache.response_cache_get(&cache_key).await {
            if let Ok(mut response) = serde_json::from_str::<ScanResponse>(&body) {
                response.cache_info.cached = true;
                response.cache_info.query_time_ms = elapsed_ms(started);
                return Ok(response);
            }
        }

        // Drive from the confidence index: already ordered when sorting by
        // confidence, otherwise just the confidence_min-filtered slice.
        let walk_descending =
            filters.sort_by == SortBy::Confidence && filters.sort_order == SortOrder::Desc;
        let candidates = self
            .cache
            .confidence_candidates(filters.confidence_min, walk_descending)
            .await?;

        let now = unix_now();
        let mut survivors: Vec<PatternRecord> = Vec::new();
        let mut partial = false;
        for id in candidates {
            if started.elapsed() > SCAN_BUDGET {
                partial = true;
                break;
            }
            // Expired between index read and record load: skip silently.
            let Some(record) = self.cache.load_record(&id).await? else {
                continue;
            };
            if filters.admits(&record, now) {
                survivors.push(record);
            }
        }

        if filters.sort_by != SortBy::Confidence {
            sort_records(&mut survivors, filters.sort_by, filters.sort_order);
        }

        let total = survivors.len() as u64;
        let per_page = filters.per_page;
        let pages = total.div_ceil(u64::from(per_page));
        let start = (filters.page as usize - 1).saturating_mul(per_page as usize);
        let page_records = survivors
            .into_iter()
            .skip(start)
            .take(per_page as usize)
            .map(|r| r.to_display(now))
            .collect();

        let response = ScanResponse {
            patterns: page_records,
            pagination: Pagination {
                page: filters.page,
                per_page,
                total,
                pages,
            },
            cache_info: CacheInfo {
                cached: false,
                query_time_ms: elapsed_ms(started),
                partial,
            },
        };

        // Partial results are not cached; they would pin an incomplete
        // view for the full response TTL.
        if !partial {
            if let Ok(body) = serde_json::to_string(&response) {
                self.cache.response_cache_put(&cache_key, &body).await;
            }
        }

        debug!(
            total,
            page = filters.page,
            query_time_ms = response.cache_info.query_time_ms,
            partial,
            "scan served"
        );
        Ok(response)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0
}

/// Stable sort by the chosen key; ties keep index order.
fn sort_records(records: &mut [PatternRecord], sort_by: SortBy, order: SortOrder) {
    let cmp = |a: &PatternRecord, b: &PatternRecord| -> Ordering {
        match sort_by {
            SortBy::Confidence => a.confidence.total_cmp(&b.confidence),
            SortBy::DetectedAt => a.detected_at.total_cmp(&b.detected_at),
            SortBy::Symbol => a.symbol.cmp(&b.symbol),
            SortBy::Rs => a.relative_strength().total_cmp(&b.relative_strength()),
            SortBy::Volume => a.relative_volume().total_cmp(&b.relative_volume()),
        }
    };
    match order {
        SortOrder::Asc => records.sort_by(cmp),
        SortOrder::Desc => records.sort_by(|a, b| cmp(b, a)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
