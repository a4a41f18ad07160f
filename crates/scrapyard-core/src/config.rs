use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;

use crate::db::Db;

/// Full application configuration.
/// Non-sensitive fields are seeded to and loaded from the DB `config` table.
/// Sensitive fields (GitHub App key) come from env/.env only.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    /// Root of the per-owner repository mirrors.
    pub repo_root: String,
    /// Root of the per-owner scraper data directories.
    pub scraper_data_root: String,

    // Container / sandbox
    pub container_image: String,
    /// Shell command run inside the container from `/repo`.
    pub scraper_command: String,
    pub default_memory_mb: u64,
    pub stop_grace_s: u64,

    // Workers
    pub worker_count: u32,
    pub worker_poll_ms: u64,
    pub max_run_attempts: u32,
    pub retry_backoff_s: i64,
    /// Refuse to queue new runs (maintenance window).
    pub read_only: bool,

    // Background loops
    pub sweep_interval_s: u64,
    pub gc_interval_s: u64,
    /// 0 disables the auto-run loop.
    pub auto_run_interval_s: u64,

    // Webhooks
    pub webhook_timeout_s: u64,

    // Web
    pub web_bind: String,
    pub web_port: u16,

    // Source host
    pub github_api_url: String,
    pub github_app_id: String,
    pub github_app_private_key_path: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_parsed<T: std::str::FromStr>(key: &str, dotenv: &HashMap<String, String>, default: T) -> T {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn resolve_tilde(path: &str) -> String {
    if path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, path.strip_prefix("~/").unwrap_or(path));
        }
    }
    path.to_string()
}

impl Config {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_s)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_s)
    }

    /// Write all non-sensitive fields to DB if not already present (first-run seeding).
    pub fn seed_db(&self, db: &Db) -> Result<()> {
        let entries: &[(&str, String)] = &[
            ("container_image", self.container_image.clone()),
            ("scraper_command", self.scraper_command.clone()),
            ("default_memory_mb", self.default_memory_mb.to_string()),
            ("stop_grace_s", self.stop_grace_s.to_string()),
            ("max_run_attempts", self.max_run_attempts.to_string()),
            ("retry_backoff_s", self.retry_backoff_s.to_string()),
            ("read_only", self.read_only.to_string()),
            ("sweep_interval_s", self.sweep_interval_s.to_string()),
            ("gc_interval_s", self.gc_interval_s.to_string()),
            ("auto_run_interval_s", self.auto_run_interval_s.to_string()),
            ("webhook_timeout_s", self.webhook_timeout_s.to_string()),
        ];
        let conn_guard = db.raw_conn();
        let conn = conn_guard.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in entries {
            conn.execute(
                "INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
                rusqlite::params![key, value],
            )?;
        }
        Ok(())
    }

    /// Return a new Config with non-sensitive fields overridden from DB values.
    pub fn load_from_db(&self, db: &Db) -> Self {
        let mut c = self.clone();
        let get = |key: &str| db.get_config(key).ok().flatten();
        let get_str = |key: &str, cur: &str| get(key).unwrap_or_else(|| cur.to_string());
        let get_bool =
            |key: &str, cur: bool| get(key).map(|v| v == "true" || v == "1").unwrap_or(cur);
        macro_rules! load {
            ($key:expr, $field:expr) => {
                if let Some(v) = get($key).and_then(|s| s.parse().ok()) {
                    $field = v;
                }
            };
        }
        c.container_image = get_str("container_image", &c.container_image);
        c.scraper_command = get_str("scraper_command", &c.scraper_command);
        c.read_only = get_bool("read_only", c.read_only);
        load!("default_memory_mb", c.default_memory_mb);
        load!("stop_grace_s", c.stop_grace_s);
        load!("max_run_attempts", c.max_run_attempts);
        load!("retry_backoff_s", c.retry_backoff_s);
        load!("sweep_interval_s", c.sweep_interval_s);
        load!("gc_interval_s", c.gc_interval_s);
        load!("auto_run_interval_s", c.auto_run_interval_s);
        load!("webhook_timeout_s", c.webhook_timeout_s);
        c
    }

    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let data_dir = resolve_tilde(&get_str("DATA_DIR", &dotenv, "store"));
        let repo_root = resolve_tilde(&get_str(
            "REPO_ROOT",
            &dotenv,
            &format!("{data_dir}/repos"),
        ));
        let scraper_data_root = resolve_tilde(&get_str(
            "SCRAPER_DATA_ROOT",
            &dotenv,
            &format!("{data_dir}/data"),
        ));

        Ok(Config {
            data_dir,
            repo_root,
            scraper_data_root,
            container_image: get_str("CONTAINER_IMAGE", &dotenv, "scrapyard/buildstep"),
            scraper_command: get_str("SCRAPER_COMMAND", &dotenv, "./scraper"),
            default_memory_mb: get_parsed("DEFAULT_MEMORY_MB", &dotenv, 512),
            stop_grace_s: get_parsed("STOP_GRACE_S", &dotenv, 10),
            worker_count: get_parsed("WORKER_COUNT", &dotenv, 4),
            worker_poll_ms: get_parsed("WORKER_POLL_MS", &dotenv, 1000),
            max_run_attempts: get_parsed("MAX_RUN_ATTEMPTS", &dotenv, 3),
            retry_backoff_s: get_parsed("RETRY_BACKOFF_S", &dotenv, 30),
            read_only: get_bool("READ_ONLY", &dotenv, false),
            sweep_interval_s: get_parsed("SWEEP_INTERVAL_S", &dotenv, 300),
            gc_interval_s: get_parsed("GC_INTERVAL_S", &dotenv, 3600),
            auto_run_interval_s: get_parsed("AUTO_RUN_INTERVAL_S", &dotenv, 86_400),
            webhook_timeout_s: get_parsed("WEBHOOK_TIMEOUT_S", &dotenv, 10),
            web_bind: get_str("WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_parsed("WEB_PORT", &dotenv, 3232),
            github_api_url: get_str("GITHUB_API_URL", &dotenv, "https://api.github.com"),
            github_app_id: get_str("GITHUB_APP_ID", &dotenv, ""),
            github_app_private_key_path: resolve_tilde(&get_str(
                "GITHUB_APP_PRIVATE_KEY_PATH",
                &dotenv,
                "",
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Db {
        let mut db = Db::open(":memory:").unwrap();
        db.migrate().unwrap();
        db
    }

    fn sample() -> Config {
        Config {
            data_dir: "store".into(),
            repo_root: "store/repos".into(),
            scraper_data_root: "store/data".into(),
            container_image: "img".into(),
            scraper_command: "./scraper".into(),
            default_memory_mb: 512,
            stop_grace_s: 10,
            worker_count: 2,
            worker_poll_ms: 100,
            max_run_attempts: 3,
            retry_backoff_s: 30,
            read_only: false,
            sweep_interval_s: 300,
            gc_interval_s: 3600,
            auto_run_interval_s: 0,
            webhook_timeout_s: 10,
            web_bind: "127.0.0.1".into(),
            web_port: 3232,
            github_api_url: "https://api.github.com".into(),
            github_app_id: String::new(),
            github_app_private_key_path: String::new(),
        }
    }

    #[test]
    fn seed_does_not_overwrite_existing_values() {
        let db = memory_db();
        db.set_config("read_only", "true").unwrap();
        sample().seed_db(&db).unwrap();
        assert_eq!(db.get_config("read_only").unwrap().as_deref(), Some("true"));
        assert_eq!(db.get_config("container_image").unwrap().as_deref(), Some("img"));
    }

    #[test]
    fn load_from_db_overrides_fields() {
        let db = memory_db();
        db.set_config("read_only", "1").unwrap();
        db.set_config("default_memory_mb", "2048").unwrap();
        db.set_config("stop_grace_s", "not-a-number").unwrap();
        let loaded = sample().load_from_db(&db);
        assert!(loaded.read_only);
        assert_eq!(loaded.default_memory_mb, 2048);
        assert_eq!(loaded.stop_grace_s, 10);
    }

    #[test]
    fn resolve_tilde_expands_home() {
        std::env::set_var("HOME", "/home/scrapyard");
        assert_eq!(resolve_tilde("~/repos"), "/home/scrapyard/repos");
        assert_eq!(resolve_tilde("/abs"), "/abs");
    }
}
