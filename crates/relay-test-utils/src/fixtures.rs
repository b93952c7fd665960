//! Builders for producer event JSON in each accepted envelope shape.

use serde_json::{json, Value};

/// Which envelope shape to wrap the pattern payload in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeShape {
    Flat,
    Nested,
    DoubleNested,
}

/// Builder for pattern-detection event JSON.
#[derive(Debug, Clone)]
pub struct PatternEventBuilder {
    symbol: String,
    pattern: String,
    confidence: f64,
    current_price: f64,
    price_change: f64,
    timestamp: Option<f64>,
    expires_at: Option<f64>,
    indicators: Value,
    source: String,
    flow_id: Option<String>,
    event_type: String,
    shape: EnvelopeShape,
    use_legacy_pattern_name: bool,
}

impl PatternEventBuilder {
    pub fn new(symbol: &str, pattern: &str, confidence: f64) -> Self {
        PatternEventBuilder {
            symbol: symbol.to_owned(),
            pattern: pattern.to_owned(),
            confidence,
            current_price: 100.0,
            price_change: 1.0,
            timestamp: None,
            expires_at: None,
            indicators: json!({"relative_strength": 1.2, "relative_volume": 1.8, "rsi": 65.0}),
            source: "daily".to_owned(),
            flow_id: None,
            event_type: "pattern_detected".to_owned(),
            shape: EnvelopeShape::Nested,
            use_legacy_pattern_name: false,
        }
    }

    pub fn price(mut self, current: f64, change: f64) -> Self {
        self.current_price = current;
        self.price_change = change;
        self
    }

    pub fn timestamp(mut self, ts: f64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn expires_at(mut self, ts: f64) -> Self {
        self.expires_at = Some(ts);
        self
    }

    pub fn indicators(mut self, indicators: Value) -> Self {
        self.indicators = indicators;
        self
    }

    pub fn source(mut self, tier: &str) -> Self {
        self.source = tier.to_owned();
        self
    }

    pub fn flow_id(mut self, id: &str) -> Self {
        self.flow_id = Some(id.to_owned());
        self
    }

    pub fn event_type(mut self, event_type: &str) -> Self {
        self.event_type = event_type.to_owned();
        self
    }

    pub fn shape(mut self, shape: EnvelopeShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn legacy_pattern_name(mut self) -> Self {
        self.use_legacy_pattern_name = true;
        self
    }

    pub fn build(&self) -> Value {
        let mut payload = json!({
            "symbol": self.symbol,
            "confidence": self.confidence,
            "current_price": self.current_price,
            "price_change": self.price_change,
            "indicators": self.indicators,
            "source": self.source,
        });
        let key = if self.use_legacy_pattern_name {
            "pattern_name"
        } else {
            "pattern"
        };
        payload[key] = json!(self.pattern);
        if let Some(ts) = self.timestamp {
            payload["timestamp"] = json!(ts);
        }
        if let Some(exp) = self.expires_at {
            payload["expires_at"] = json!(exp);
        }

        match self.shape {
            EnvelopeShape::Flat => {
                let mut flat = payload;
                if let Some(flow) = &self.flow_id {
                    flat["flow_id"] = json!(flow);
                }
                flat
            }
            EnvelopeShape::Nested => {
                let mut envelope = json!({
                    "event_type": self.event_type,
                    "source": "tickstock-pl",
                    "data": payload,
                });
                if let Some(ts) = self.timestamp {
                    envelope["timestamp"] = json!(ts);
                }
                if let Some(flow) = &self.flow_id {
                    envelope["flow_id"] = json!(flow);
                }
                envelope
            }
            EnvelopeShape::DoubleNested => {
                let mut inner = json!({"data": payload});
                if let Some(flow) = &self.flow_id {
                    inner["flow_id"] = json!(flow);
                }
                let mut envelope = json!({
                    "event_type": self.event_type,
                    "source": "tickstock-pl",
                    "data": inner,
                });
                if let Some(ts) = self.timestamp {
                    envelope["timestamp"] = json!(ts);
                }
                envelope
            }
        }
    }

    pub fn build_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.build()).expect("fixture serializes")
    }
}

/// Backtest progress event JSON.
pub fn backtest_progress(job_id: &str, progress: f64, user_id: Option<&str>) -> Value {
    let mut data = json!({
        "job_id": job_id,
        "progress": progress,
        "current_symbol": "AAPL",
    });
    if let Some(u) = user_id {
        data["user_id"] = json!(u);
    }
    json!({
        "event_type": "backtest_progress",
        "source": "tickstock-pl",
        "timestamp": 1_700_000_000.0,
        "data": data,
    })
}

/// Backtest result event JSON.
pub fn backtest_result(job_id: &str, status: &str, user_id: Option<&str>) -> Value {
    let mut data = json!({
        "job_id": job_id,
        "status": status,
        "results": {"win_rate": 0.62},
    });
    if let Some(u) = user_id {
        data["user_id"] = json!(u);
    }
    json!({
        "event_type": "backtest_result",
        "source": "tickstock-pl",
        "timestamp": 1_700_000_000.0,
        "data": data,
    })
}

/// Producer health event JSON.
pub fn system_health(status: &str) -> Value {
    json!({
        "event_type": "system_health",
        "source": "tickstock-pl",
        "timestamp": 1_700_000_000.0,
        "data": {"status": status},
    })
}
