use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

// ── Owners / Scrapers ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    User,
    Organization,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Organization => "organization",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "organization" => Self::Organization,
            _ => Self::User,
        }
    }
}

/// A user or organization. Owns scrapers and supplies sync credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub id: i64,
    pub nickname: String,
    pub kind: OwnerKind,
}

/// Whether `s` is usable as an owner nickname or scraper name. Both become
/// path components of the mirror and data directories and of container
/// mount specs, so only `[A-Za-z0-9_-]` is accepted.
pub fn is_valid_path_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A scraper as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scraper {
    pub id: i64,
    pub owner_id: i64,
    /// Nickname of the owner, joined in on load.
    pub owner_nickname: String,
    pub name: String,
    /// "owner/name" on the source host.
    pub full_name: String,
    /// https clone URL on the source host. Never contains credentials.
    pub git_url: String,
    /// Memory ceiling for runs. `None` = use the configured default.
    pub memory_mb: Option<u64>,
    pub auto_run: bool,
    pub repo_size: u64,
    pub data_size: u64,
}

impl Scraper {
    pub fn repo_path(&self, repo_root: &str) -> String {
        format!("{repo_root}/{}/{}", self.owner_nickname, self.name)
    }

    pub fn data_path(&self, data_root: &str) -> String {
        format!("{data_root}/{}/{}", self.owner_nickname, self.name)
    }
}

/// Prefix every scraper variable name carries.
pub const VARIABLE_PREFIX: &str = "SCRAPYARD_";

/// Set by the executor itself; not available as a scraper variable.
pub const RUN_ID_VARIABLE: &str = "SCRAPYARD_RUN_ID";

/// `SCRAPYARD_` followed by one or more of `[A-Z0-9_]`, and not a name the
/// executor sets itself.
pub fn is_valid_variable_name(name: &str) -> bool {
    match name.strip_prefix(VARIABLE_PREFIX) {
        Some(rest) => {
            !rest.is_empty()
                && rest
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
                && name != RUN_ID_VARIABLE
        }
        None => false,
    }
}

/// A secret environment variable exported into every run of a scraper.
/// `Debug` redacts the value.
#[derive(Debug)]
pub struct Variable {
    pub id: i64,
    pub scraper_id: i64,
    pub name: String,
    pub value: SecretString,
}

// ── Runs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Error,
    Stopped,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Lifecycle state derived from a run's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Queued,
    Running,
    Finished,
}

/// One execution attempt of a scraper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub scraper_id: i64,
    pub owner_id: i64,
    /// Queued by the auto-run loop rather than by hand.
    pub auto: bool,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    /// Container exit status, when the container ran to completion.
    pub status_code: Option<i64>,
    pub container_id: Option<String>,
    /// Mirror HEAD at the moment the run started.
    pub git_revision: Option<String>,
    /// Seconds between start and finish.
    pub wall_time: f64,
}

impl Run {
    pub fn state(&self) -> RunState {
        if self.finished_at.is_some() {
            RunState::Finished
        } else if self.started_at.is_some() {
            RunState::Running
        } else {
            RunState::Queued
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn finished_successfully(&self) -> bool {
        self.outcome == Some(RunOutcome::Success)
    }
}

/// CPU accounting sample for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub utime: f64,
    pub stime: f64,
    pub maxrss_kb: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A single line of scraper output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

// ── Webhooks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub scraper_id: i64,
    pub url: String,
}

/// Record of one delivery attempt of a webhook for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: i64,
    /// Non-owning; becomes `None` when the run is deleted.
    pub run_id: Option<i64>,
    pub response_code: Option<i64>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ── Queue ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Retry,
    Claimed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retry => "retry",
            Self::Claimed => "claimed",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "retry" => Self::Retry,
            "claimed" => Self::Claimed,
            _ => Self::Pending,
        }
    }
}

/// An execution request on the run queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJob {
    pub id: i64,
    pub run_id: i64,
    pub state: JobState,
    pub attempts: i64,
    pub claimed_by: Option<String>,
    pub available_at: DateTime<Utc>,
    pub last_error: String,
}
