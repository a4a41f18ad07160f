//! Mirror a scraper's repository with owner-scoped credentials, then refresh
//! its repository size and contributor list.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::Db;
use crate::dirsize::directory_size;
use crate::git::Git;
use crate::github::{SourceHost, SourceHostError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced,
    /// The owner has no integration; nothing was touched.
    MissingIntegration,
    ProviderFailed,
    MirrorFailed,
}

impl SyncOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Synced)
    }
}

/// Embed `token` in an `https://` clone URL. Other URLs pass through unchanged.
pub fn authenticated_url(git_url: &str, token: &SecretString) -> SecretString {
    match git_url.strip_prefix("https://") {
        Some(rest) => SecretString::from(format!(
            "https://x-access-token:{}@{rest}",
            token.expose_secret()
        )),
        None => SecretString::from(git_url.to_string()),
    }
}

pub struct RepoSync {
    db: Arc<Db>,
    host: Arc<dyn SourceHost>,
    repo_root: String,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepoSync {
    pub fn new(db: Arc<Db>, host: Arc<dyn SourceHost>, repo_root: impl Into<String>) -> Self {
        Self {
            db,
            host,
            repo_root: repo_root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn scraper_lock(&self, scraper_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(scraper_id).or_default().clone()
    }

    /// Drop the scraper's lock once no sync holds or waits on it.
    fn release_lock(&self, scraper_id: i64, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks
            .get(&scraper_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&scraper_id);
        }
    }

    /// Synchronise one scraper. Concurrent calls for the same scraper run
    /// one after another. Errors are only returned for store failures.
    pub async fn sync(&self, scraper_id: i64) -> Result<SyncOutcome> {
        let lock = self.scraper_lock(scraper_id);
        let outcome = {
            let _guard = lock.lock().await;
            self.sync_locked(scraper_id).await
        };
        self.release_lock(scraper_id, lock);
        outcome
    }

    async fn sync_locked(&self, scraper_id: i64) -> Result<SyncOutcome> {
        let scraper = self
            .db
            .get_scraper(scraper_id)?
            .ok_or_else(|| anyhow!("scraper #{scraper_id} not found"))?;
        let owner = scraper.owner_nickname.clone();

        let token = match self.host.installation_token(&owner).await {
            Ok(token) => token,
            Err(SourceHostError::NotInstalled(_)) => {
                warn!(scraper_id, owner = %owner, "sync: owner has no app installation, skipping");
                return Ok(SyncOutcome::MissingIntegration);
            }
            Err(e) => {
                warn!(scraper_id, owner = %owner, "sync: could not obtain installation token: {e}");
                return Ok(SyncOutcome::ProviderFailed);
            }
        };

        let repo_path = scraper.repo_path(&self.repo_root);
        let fetch_url = authenticated_url(&scraper.git_url, &token);
        let plain_url = scraper.git_url.clone();
        let secret = SecretString::from(token.expose_secret().to_string());
        let mirror_path = repo_path.clone();
        let mirrored = tokio::task::spawn_blocking(move || {
            Git::new(mirror_path).mirror(
                fetch_url.expose_secret(),
                &plain_url,
                secret.expose_secret(),
            )
        })
        .await
        .map_err(|e| anyhow!("sync task panicked: {e}"))
        .and_then(|r| r);

        if let Err(e) = mirrored {
            warn!(scraper_id, full_name = %scraper.full_name, "sync: mirror failed: {e}");
            return Ok(SyncOutcome::MirrorFailed);
        }

        let size_path = repo_path.clone();
        match tokio::task::spawn_blocking(move || directory_size(size_path)).await {
            Ok(size) => {
                if let Err(e) = self.db.update_repo_size(scraper_id, size) {
                    warn!(scraper_id, "sync: failed to record repo size: {e}");
                }
            }
            Err(e) => warn!(scraper_id, "sync: repo size task failed: {e}"),
        }

        if let Err(e) = self.refresh_contributors(scraper_id, &scraper.full_name, &token).await {
            warn!(scraper_id, "sync: failed to refresh contributors: {e}");
        }

        info!(scraper_id, full_name = %scraper.full_name, "sync: repository mirrored");
        Ok(SyncOutcome::Synced)
    }

    async fn refresh_contributors(
        &self,
        scraper_id: i64,
        full_name: &str,
        token: &SecretString,
    ) -> Result<()> {
        let nicknames = self.host.contributor_nicknames(full_name, token).await?;
        let mut owner_ids = Vec::with_capacity(nicknames.len());
        for nickname in &nicknames {
            owner_ids.push(self.db.find_or_create_user(nickname)?);
        }
        self.db.replace_contributors(scraper_id, &owner_ids)?;
        Ok(())
    }
}
