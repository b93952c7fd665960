// relay-protocol: Producer event envelopes, cached-record shapes, and
// socket message serialization.
//
// Ingress messages use a top-level `event_type` field; pattern payloads
// arrive in three historically-observed envelope shapes (flat, nested,
// double-nested) which `parse_pattern_event` normalizes into one
// `PatternPayload`.  Egress socket messages use a top-level `type` field.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Event kinds and channels
// ---------------------------------------------------------------------------

/// Producer event kinds this tier consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PatternDetected,
    BacktestProgress,
    BacktestResult,
    SystemHealth,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PatternDetected => "pattern_detected",
            EventKind::BacktestProgress => "backtest_progress",
            EventKind::BacktestResult => "backtest_result",
            EventKind::SystemHealth => "system_health",
        }
    }
}

/// Default ingress channel names.  Overridable via config; these defaults
/// are part of the wire contract with the producer.
pub mod channels {
    pub const PATTERNS: &str = "tickstock.events.patterns";
    pub const BACKTEST_PROGRESS: &str = "tickstock.events.backtesting.progress";
    pub const BACKTEST_RESULTS: &str = "tickstock.events.backtesting.results";
    pub const HEALTH: &str = "tickstock.health.status";
}

/// Egress socket topics.
pub mod topics {
    pub const PATTERN_ALERT: &str = "pattern_alert";
    pub const BACKTEST_PROGRESS: &str = "backtest_progress";
    pub const BACKTEST_RESULT: &str = "backtest_result";
    pub const SYSTEM_HEALTH: &str = "system_health";
    pub const DASHBOARD_PRICE_UPDATE: &str = "dashboard_price_update";
    pub const DASHBOARD_OHLCV_UPDATE: &str = "dashboard_ohlcv_update";
    pub const DASHBOARD_MARKET_SUMMARY: &str = "dashboard_market_summary";
    pub const WATCHLIST_UPDATE: &str = "watchlist_update";
}

// ---------------------------------------------------------------------------
// Detector tiers
// ---------------------------------------------------------------------------

/// The detector pipeline that produced a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    Daily,
    Intraday,
    Combo,
    Fallback,
    #[default]
    Unknown,
}

impl SourceTier {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceTier::Daily => "daily",
            SourceTier::Intraday => "intraday",
            SourceTier::Combo => "combo",
            SourceTier::Fallback => "fallback",
            SourceTier::Unknown => "unknown",
        }
    }

    /// Lenient parse: unrecognized tier names map to `Unknown` rather than
    /// dropping the event.
    pub fn parse(s: &str) -> Self {
        match s {
            "daily" => SourceTier::Daily,
            "intraday" => SourceTier::Intraday,
            "combo" => SourceTier::Combo,
            "fallback" => SourceTier::Fallback,
            _ => SourceTier::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern events (ingress)
// ---------------------------------------------------------------------------

/// What a pattern-channel event asks the cache to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternAction {
    Detected,
    Expired,
    Updated,
}

/// Normalized pattern payload, independent of the envelope shape it
/// arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternPayload {
    pub symbol: String,
    pub pattern: String,
    /// Detector-reported probability in `[0, 1]`.
    pub confidence: f64,
    pub current_price: f64,
    /// Percent change.
    pub price_change: f64,
    /// Detection instant (unix seconds); falls back to the envelope
    /// timestamp, then to receive time, when absent.
    pub timestamp: Option<f64>,
    /// Instant after which the pattern is no longer valid for scans.
    /// Defaults to `now + pattern_cache_ttl` when absent.
    pub expires_at: Option<f64>,
    pub indicators: HashMap<String, f64>,
    pub source: SourceTier,
}

/// Why an ingress message could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Payload nested deeper than `data.data`.  Dropped with a metric.
    TooDeep,
    /// Neither `pattern` nor the legacy `pattern_name` field present.
    MissingPattern,
    MissingSymbol,
    /// `event_type` present but not one of the pattern actions.
    UnknownAction(String),
    /// Required payload field has the wrong JSON type.
    BadField(&'static str),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::TooDeep => write!(f, "payload nested deeper than data.data"),
            EnvelopeError::MissingPattern => write!(f, "missing pattern/pattern_name field"),
            EnvelopeError::MissingSymbol => write!(f, "missing symbol field"),
            EnvelopeError::UnknownAction(a) => write!(f, "unknown pattern event_type: {}", a),
            EnvelopeError::BadField(name) => write!(f, "field has wrong type: {}", name),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// A fully-parsed pattern-channel event.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternEvent {
    pub action: PatternAction,
    pub payload: PatternPayload,
    /// Correlation id extracted from the envelope, if the producer sent one.
    pub flow_id: Option<String>,
    /// Envelope-level `source` (producer id).
    pub producer: String,
    /// Envelope-level `timestamp` (unix seconds).
    pub timestamp: Option<f64>,
}

fn field_f64(v: &serde_json::Value, name: &'static str) -> Result<Option<f64>, EnvelopeError> {
    match v.get(name) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(val) => val.as_f64().map(Some).ok_or(EnvelopeError::BadField(name)),
    }
}

fn field_str(v: &serde_json::Value, name: &str) -> Option<String> {
    v.get(name).and_then(|s| s.as_str()).map(ToOwned::to_owned)
}

/// Normalize a pattern-channel message.
///
/// Accepted envelope shapes, tried nested-first:
/// - double-nested: `{"data": {"data": {...payload}, "flow_id": "..."}}`
/// - single-nested: `{"data": {...payload}}`
/// - flat: `{...payload}`
///
/// The legacy `pattern_name` field is accepted as a synonym for `pattern`.
/// Payloads nested deeper than `data.data` are rejected with
/// [`EnvelopeError::TooDeep`].
pub fn parse_pattern_event(raw: &serde_json::Value) -> Result<PatternEvent, EnvelopeError> {
    let action = match raw.get("event_type").and_then(|v| v.as_str()) {
        None => PatternAction::Detected,
        Some("pattern_detected") => PatternAction::Detected,
        Some("pattern_expired") => PatternAction::Expired,
        Some("pattern_updated") => PatternAction::Updated,
        Some(other) => return Err(EnvelopeError::UnknownAction(other.to_owned())),
    };

    // Locate the payload object, nested shapes first.
    let (payload, flow_id) = match raw.get("data").filter(|d| d.is_object()) {
        Some(d1) => match d1.get("data").filter(|d| d.is_object()) {
            Some(d2) => {
                if d2.get("data").is_some_and(serde_json::Value::is_object) {
                    return Err(EnvelopeError::TooDeep);
                }
                (d2, field_str(raw, "flow_id").or_else(|| field_str(d1, "flow_id")))
            }
            None => (d1, field_str(raw, "flow_id")),
        },
        None => (raw, field_str(raw, "flow_id")),
    };

    let symbol = field_str(payload, "symbol").ok_or(EnvelopeError::MissingSymbol)?;
    let pattern = field_str(payload, "pattern")
        .or_else(|| field_str(payload, "pattern_name"))
        .ok_or(EnvelopeError::MissingPattern)?;

    let mut indicators = HashMap::new();
    if let Some(map) = payload.get("indicators").and_then(|v| v.as_object()) {
        for (k, v) in map {
            if let Some(n) = v.as_f64() {
                indicators.insert(k.clone(), n);
            }
        }
    }

    Ok(PatternEvent {
        action,
        payload: PatternPayload {
            symbol,
            pattern,
            confidence: field_f64(payload, "confidence")?.unwrap_or(0.0),
            current_price: field_f64(payload, "current_price")?.unwrap_or(0.0),
            price_change: field_f64(payload, "price_change")?.unwrap_or(0.0),
            timestamp: field_f64(payload, "timestamp")?,
            expires_at: field_f64(payload, "expires_at")?,
            indicators,
            source: payload
                .get("source")
                .and_then(|v| v.as_str())
                .map_or(SourceTier::Unknown, SourceTier::parse),
        },
        flow_id,
        producer: field_str(raw, "source").unwrap_or_else(|| "unknown".to_owned()),
        timestamp: field_f64(raw, "timestamp")?,
    })
}

// ---------------------------------------------------------------------------
// Backtest events (ingress)
// ---------------------------------------------------------------------------

/// Progress update for a long-running backtest job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestProgress {
    pub job_id: String,
    /// Fraction complete in `[0, 1]`.
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<String>,
    /// The user that launched the job, when the producer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Terminal result of a backtest job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub job_id: String,
    /// `"completed"` or `"failed"`.
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub results: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

fn default_status() -> String {
    "completed".to_owned()
}

// ---------------------------------------------------------------------------
// Typed bus event (dispatched by the subscriber)
// ---------------------------------------------------------------------------

/// One consumed bus message, classified by channel and parsed.
///
/// `raw` keeps the full envelope so egress socket messages can forward it
/// verbatim the way the producer sent it.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub kind: EventKind,
    pub channel: String,
    /// Producer id from the envelope (`"unknown"` when absent).
    pub source: String,
    /// Envelope timestamp (unix seconds); receive time when absent.
    pub timestamp: f64,
    pub raw: serde_json::Value,
    pub payload: EventPayload,
}

/// Exhaustively-matched payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    Pattern(PatternEvent),
    BacktestProgress(BacktestProgress),
    BacktestResult(BacktestResult),
    SystemHealth(serde_json::Value),
}

impl BusEvent {
    /// The socket-friendly projection of the envelope, forwarded inside
    /// egress messages.
    pub fn to_socket_value(&self) -> serde_json::Value {
        serde_json::json!({
            "event_type": self.kind.as_str(),
            "source": &self.source,
            "timestamp": self.timestamp,
            "data": &self.raw,
            "channel": &self.channel,
        })
    }
}

// ---------------------------------------------------------------------------
// Cached pattern record (stored by the cache, served by scans)
// ---------------------------------------------------------------------------

/// A detected pattern as stored in the cache.
///
/// Identified by `{symbol}:{pattern_type}:{floor(detected_at)}`; visible to
/// scans only while `now < expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub symbol: String,
    pub pattern_type: String,
    pub confidence: f64,
    pub current_price: f64,
    pub price_change: f64,
    /// Unix seconds.
    pub detected_at: f64,
    /// Unix seconds.
    pub expires_at: f64,
    #[serde(default)]
    pub indicators: HashMap<String, f64>,
    #[serde(default)]
    pub source_tier: SourceTier,
}

impl PatternRecord {
    /// Derived cache id: `symbol:pattern_type:floor(detected_at)`.
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.symbol, self.pattern_type, self.detected_at as i64
        )
    }

    pub fn relative_strength(&self) -> f64 {
        *self.indicators.get("relative_strength").unwrap_or(&1.0)
    }

    pub fn relative_volume(&self) -> f64 {
        *self.indicators.get("relative_volume").unwrap_or(&1.0)
    }

    pub fn rsi(&self) -> f64 {
        *self.indicators.get("rsi").unwrap_or(&50.0)
    }

    /// Convert to the externally-visible display shape, evaluated at `now`
    /// (unix seconds).
    pub fn to_display(&self, now: f64) -> DisplayPattern {
        DisplayPattern {
            symbol: self.symbol.clone(),
            pattern: abbreviate_pattern(&self.pattern_type),
            conf: (self.confidence * 100.0).round() / 100.0,
            rs: format!("{:.1}x", self.relative_strength()),
            vol: format!("{:.1}x", self.relative_volume()),
            price: format!("${:.2}", self.current_price),
            chg: format!("{:+.1}%", self.price_change),
            time: format_time_ago(now - self.detected_at),
            exp: format_expiration(self.expires_at - now),
            source: self.source_tier.as_str().to_owned(),
        }
    }
}

/// Abbreviated pattern names for the display shape; unknown patterns keep
/// their first 8 characters.
pub fn abbreviate_pattern(pattern_type: &str) -> String {
    match pattern_type {
        "Weekly_Breakout" => "WeeklyBO",
        "Bull_Flag" => "BullFlag",
        "Trendline_Hold" => "TrendHold",
        "Volume_Spike" => "VolSpike",
        "Gap_Fill" => "GapFill",
        "Momentum_Shift" => "MomShift",
        "Support_Test" => "Support",
        "Resistance_Break" => "ResBreak",
        "Ascending_Triangle" => "AscTri",
        "Reversal_Signal" => "Reversal",
        "Doji" => "Doji",
        "Hammer" => "Hammer",
        "Engulfing" => "Engulfing",
        other => return other.chars().take(8).collect(),
    }
    .to_owned()
}

/// Human delta since detection: `Ns`/`Nm`/`Nh`/`Nd` by magnitude.
pub fn format_time_ago(seconds_ago: f64) -> String {
    let s = seconds_ago.max(0.0);
    if s < 60.0 {
        format!("{}s", s as i64)
    } else if s < 3600.0 {
        format!("{}m", (s / 60.0) as i64)
    } else if s < 86400.0 {
        format!("{}h", (s / 3600.0) as i64)
    } else {
        format!("{}d", (s / 86400.0) as i64)
    }
}

/// Human delta until expiry; `"Expired"` once past.
pub fn format_expiration(expires_in: f64) -> String {
    if expires_in <= 0.0 {
        "Expired".to_owned()
    } else if expires_in < 3600.0 {
        format!("{}m", (expires_in / 60.0) as i64)
    } else if expires_in < 86400.0 {
        format!("{}h", (expires_in / 3600.0) as i64)
    } else {
        format!("{}d", (expires_in / 86400.0) as i64)
    }
}

// ---------------------------------------------------------------------------
// Scan response DTOs (the only HTTP contract this tier exposes)
// ---------------------------------------------------------------------------

/// Per-record display projection served by scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayPattern {
    pub symbol: String,
    pub pattern: String,
    pub conf: f64,
    pub rs: String,
    pub vol: String,
    pub price: String,
    pub chg: String,
    pub time: String,
    pub exp: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub pages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub cached: bool,
    pub query_time_ms: f64,
    /// Set when the scan exceeded its wall-clock budget and returned a
    /// partial result set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub patterns: Vec<DisplayPattern>,
    pub pagination: Pagination,
    pub cache_info: CacheInfo,
}

// ---------------------------------------------------------------------------
// Socket messages (egress)
// ---------------------------------------------------------------------------

/// One message delivered to a browser connection.
///
/// Serializes as `{"type": "<topic>", "event": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketMessage {
    #[serde(rename = "type")]
    pub topic: String,
    pub event: serde_json::Value,
}

impl SocketMessage {
    pub fn new(topic: impl Into<String>, event: serde_json::Value) -> Self {
        SocketMessage {
            topic: topic.into(),
            event,
        }
    }

    /// Durable messages survive the user being offline (queued to the
    /// per-user stream); market-data ticks do not.
    pub fn is_durable(&self) -> bool {
        self.topic == topics::PATTERN_ALERT
    }
}
