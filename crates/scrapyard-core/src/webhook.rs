//! Notify a scraper's webhooks that one of its runs finished.
//!
//! Each (webhook, run) pair gets exactly one delivery record, created before
//! the request is sent. The record is completed with the response code and
//! send time when any HTTP response arrives; a transport failure leaves it
//! incomplete and is only logged. A webhook whose record cannot be created
//! is skipped and counted as failed; the rest are still notified.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::db::Db;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub created: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct WebhookDispatcher {
    db: Arc<Db>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(db: Arc<Db>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("scrapyard-webhook")
            .build()?;
        Ok(Self { db, client })
    }

    pub async fn dispatch(&self, run_id: i64) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let Some(run) = self.db.get_run(run_id)? else {
            debug!(run_id, "webhook: run no longer exists, nothing to dispatch");
            return Ok(report);
        };

        let mut pending = Vec::new();
        for hook in self.db.list_webhooks(run.scraper_id)? {
            match self.db.create_delivery(hook.id, run_id) {
                Ok(Some(delivery_id)) => pending.push((delivery_id, hook.id, hook.url)),
                Ok(None) => debug!(run_id, webhook_id = hook.id, "webhook: delivery already exists"),
                Err(e) => {
                    warn!(run_id, webhook_id = hook.id, "webhook: failed to create delivery: {e:#}");
                    report.failed += 1;
                }
            }
        }
        report.created = pending.len();

        let mut set = JoinSet::new();
        for (delivery_id, webhook_id, url) in pending {
            let client = self.client.clone();
            let db = Arc::clone(&self.db);
            set.spawn(async move {
                match client.post(&url).send().await {
                    Ok(resp) => {
                        let code = resp.status().as_u16();
                        if let Err(e) = db.record_delivery_response(delivery_id, code) {
                            warn!(run_id, webhook_id, "webhook: failed to record response: {e}");
                        }
                        debug!(run_id, webhook_id, code, "webhook: delivered");
                        true
                    }
                    Err(e) => {
                        warn!(run_id, webhook_id, "webhook: delivery failed: {}", e.without_url());
                        false
                    }
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(true) => report.delivered += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    warn!(run_id, "webhook: delivery task failed: {e}");
                    report.failed += 1;
                }
            }
        }

        if report.created > 0 {
            info!(
                run_id,
                delivered = report.delivered,
                failed = report.failed,
                "webhook: dispatch finished"
            );
        }
        Ok(report)
    }
}
