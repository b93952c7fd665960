//! Flow logging: correlates one detection end-to-end via a flow id.
//!
//! Checkpoints are recorded fire-and-forget to the `flows:checkpoints`
//! bus stream and mirrored to tracing; a logger failure never blocks the
//! data path.  Elapsed times are measured from the flow's first
//! checkpoint; start instants are pruned on the terminal checkpoint or
//! after five minutes.

use relay_bus::BusClient;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

pub const FLOW_STREAM: &str = "flows:checkpoints";

const STALE_FLOW_AGE: Duration = Duration::from_secs(300);

/// Named checkpoints on a pattern event's path, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    EventReceived,
    EventParsed,
    PatternCached,
    UserFiltered,
    WebsocketDelivered,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 5] = [
        Checkpoint::EventReceived,
        Checkpoint::EventParsed,
        Checkpoint::PatternCached,
        Checkpoint::UserFiltered,
        Checkpoint::WebsocketDelivered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Checkpoint::EventReceived => "EVENT_RECEIVED",
            Checkpoint::EventParsed => "EVENT_PARSED",
            Checkpoint::PatternCached => "PATTERN_CACHED",
            Checkpoint::UserFiltered => "USER_FILTERED",
            Checkpoint::WebsocketDelivered => "WEBSOCKET_DELIVERED",
        }
    }

    fn index(self) -> usize {
        match self {
            Checkpoint::EventReceived => 0,
            Checkpoint::EventParsed => 1,
            Checkpoint::PatternCached => 2,
            Checkpoint::UserFiltered => 3,
            Checkpoint::WebsocketDelivered => 4,
        }
    }

    fn is_terminal(self) -> bool {
        self == Checkpoint::WebsocketDelivered
    }
}

// ---------------------------------------------------------------------------
// FlowLogger
// ---------------------------------------------------------------------------

pub struct FlowLogger {
    bus: Arc<BusClient>,
    starts: Mutex<HashMap<String, Instant>>,
    counts: [AtomicU64; 5],
}

impl FlowLogger {
    pub fn new(bus: Arc<BusClient>) -> Self {
        FlowLogger {
            bus,
            starts: Mutex::new(HashMap::new()),
            counts: Default::default(),
        }
    }

    /// Use the producer's flow id when present, otherwise mint one.
    pub fn begin(&self, incoming: Option<String>) -> String {
        incoming.unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Record one checkpoint.  Returns the elapsed milliseconds since the
    /// flow's first checkpoint.
    pub fn checkpoint(&self, flow_id: &str, checkpoint: Checkpoint, detail: &str) -> f64 {
        let elapsed_ms = {
            let mut starts = self.starts.lock().expect("flow lock");
            if starts.len() > 10_000 {
                starts.retain(|_, at| at.elapsed() < STALE_FLOW_AGE);
            }
            let start = *starts.entry(flow_id.to_owned()).or_insert_with(Instant::now);
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            if checkpoint.is_terminal() {
                starts.remove(flow_id);
            }
            elapsed
        };

        self.counts[checkpoint.index()].fetch_add(1, Ordering::Relaxed);
        debug!(
            flow_id,
            checkpoint = checkpoint.as_str(),
            elapsed_ms,
            detail,
            "flow checkpoint"
        );

        // Fire-and-forget: the record is appended in the background and a
        // failed append only logs.
        let bus = Arc::clone(&self.bus);
        let fields = vec![
            ("flow_id".to_owned(), flow_id.to_owned()),
            ("checkpoint".to_owned(), checkpoint.as_str().to_owned()),
            ("ts".to_owned(), chrono::Utc::now().to_rfc3339()),
            ("elapsed_ms".to_owned(), format!("{elapsed_ms:.3}")),
            ("detail".to_owned(), detail.to_owned()),
        ];
        tokio::spawn(async move {
            if let Err(e) = bus.xadd(FLOW_STREAM, &fields).await {
                debug!(error = %e, "flow checkpoint append failed");
            }
        });

        elapsed_ms
    }

    /// Checkpoints recorded since start, by checkpoint.
    pub fn counts(&self) -> HashMap<&'static str, u64> {
        Checkpoint::ALL
            .iter()
            .map(|c| (c.as_str(), self.counts[c.index()].load(Ordering::Relaxed)))
            .collect()
    }

    /// Flows that have started but not reached the terminal checkpoint.
    pub fn live_flows(&self) -> usize {
        self.starts.lock().expect("flow lock").len()
    }
}
