use std::{collections::VecDeque, sync::Arc};

use tokio::sync::broadcast;

const RING_CAPACITY: usize = 500;

/// Mirrors every log event as a JSON line onto a broadcast channel (live
/// SSE subscribers) and a bounded ring (replayed to new subscribers).
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    run_id: Option<i64>,
    scraper_id: Option<i64>,
}

impl tracing::field::Visit for EventVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        match field.name() {
            "run_id" => self.run_id = Some(value),
            "scraper_id" => self.scraper_id = Some(value),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
            if self.message.len() >= 2 && self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }
}

/// Log category shown in the dashboard, derived from the module path or the
/// message prefix.
fn category(target: &str, message: &str) -> &'static str {
    let prefix = message.split(':').next().unwrap_or("");
    if target.contains("scheduler") || target.contains("docker") || prefix == "scheduler" || prefix == "docker" {
        "scheduler"
    } else if target.contains("sync") || target.contains("github") || prefix == "sync" {
        "sync"
    } else if target.contains("reconcile") || target.contains("maintenance") || prefix == "sweep" {
        "sweep"
    } else if target.contains("webhook") || prefix == "webhook" {
        "webhook"
    } else {
        "system"
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        let category = category(event.metadata().target(), &visitor.message);

        let json = serde_json::json!({
            "ts": chrono::Utc::now().timestamp(),
            "level": level,
            "category": category,
            "message": visitor.message,
            "run_id": visitor.run_id,
            "scraper_id": visitor.scraper_id,
        })
        .to_string();

        let _ = self.tx.send(json.clone());
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(json);
            if ring.len() > RING_CAPACITY {
                ring.pop_front();
            }
        }
    }
}
