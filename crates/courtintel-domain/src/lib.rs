#![forbid(unsafe_code)]

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

pub const MAX_AUDIT_LOG_LISTING: usize = 50;
pub const NARRATIVE_MAX_WORDS: usize = 500;

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(value: &str) -> anyhow::Result<Self> {
                let ulid = Ulid::from_str(value)
                    .map_err(|err| anyhow::anyhow!("invalid {} ULID: {err}", $label))?;
                Ok(Self(ulid))
            }
        }
    };
}

ulid_id!(UserId, "user_id");
ulid_id!(CaseId, "case_id");
ulid_id!(RulingId, "ruling_id");
ulid_id!(BiasCheckId, "bias_check_id");
ulid_id!(AuditLogId, "log_id");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CaseCreate,
    CaseDelete,
    RulingGenerated,
    BiasChecked,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CaseCreate => "case_create",
            Self::CaseDelete => "case_delete",
            Self::RulingGenerated => "ruling_generated",
            Self::BiasChecked => "bias_checked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NewCase {
    pub title: String,
    pub narrative: String,
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CaseRecord {
    pub case_id: CaseId,
    pub user_id: UserId,
    pub title: String,
    pub narrative: String,
    pub locale: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

impl CaseRecord {
    #[must_use]
    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.user_id == user_id
    }
}

/// Token accounting reported by the model backend for one completion.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TokenUsage {
    pub model_name: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Field values written on every ruling upsert.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RulingFields {
    pub verdict: String,
    pub rationale: String,
    pub citations: Vec<String>,
    pub risk_flags: Vec<String>,
    pub model_name: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RulingRecord {
    pub ruling_id: RulingId,
    pub case_id: CaseId,
    pub verdict: String,
    pub rationale: String,
    pub citations: Vec<String>,
    pub risk_flags: Vec<String>,
    pub model_name: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BiasCheckFields {
    pub bias_score: f64,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BiasCheckRecord {
    pub bias_check_id: BiasCheckId,
    pub ruling_id: RulingId,
    pub bias_score: f64,
    pub notes: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLogEntry {
    pub log_seq: i64,
    pub log_id: AuditLogId,
    pub user_id: UserId,
    pub action: String,
    pub metadata: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

/// Display form of a ruling. `plain_explanation` is derived on every read.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RulingView {
    pub verdict: String,
    pub rationale: String,
    pub plain_explanation: String,
    pub citations: Vec<String>,
    pub risk_flags: Vec<String>,
    pub model_name: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

impl From<&RulingRecord> for RulingView {
    fn from(value: &RulingRecord) -> Self {
        Self {
            verdict: value.verdict.clone(),
            rationale: value.rationale.clone(),
            plain_explanation: plain_language_explanation(&value.rationale),
            citations: value.citations.clone(),
            risk_flags: value.risk_flags.clone(),
            model_name: value.model_name.clone(),
            tokens_in: value.tokens_in,
            tokens_out: value.tokens_out,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BiasCheckView {
    pub bias_score: f64,
    pub notes: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

impl From<&BiasCheckRecord> for BiasCheckView {
    fn from(value: &BiasCheckRecord) -> Self {
        Self {
            bias_score: value.bias_score,
            notes: value.notes.clone(),
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RulingResult {
    pub ruling: RulingView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias_check: Option<BiasCheckView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseDetail {
    #[serde(flatten)]
    pub case: CaseRecord,
    pub ruling: Option<RulingView>,
    pub bias_check: Option<BiasCheckView>,
}

/// Failures of the model backend or of its output. Always terminal for the
/// stage that produced them.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UpstreamFailure {
    #[error("model backend returned no usable text")]
    EmptyResponse,
    #[error("model backend transport failure: {0}")]
    Transport(String),
    #[error("model backend returned http status {status}")]
    Status { status: u16 },
    #[error("model backend returned a malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("unparseable model output: {0}")]
    Unparseable(String),
    #[error("incomplete model output: missing {0}")]
    Incomplete(&'static str),
    #[error("invalid model output: {field} {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("OPENAI_API_KEY must be set")]
    MissingApiKey,
    #[error("invalid model backend base url: {0}")]
    InvalidBaseUrl(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CaseValidationError {
    #[error("title must be between 3 and 120 characters")]
    Title,
    #[error("narrative must be at least 5 characters and between 1 and 500 words")]
    Narrative,
    #[error("locale must be between 2 and 80 characters")]
    Locale,
    #[error("username must be between 3 and 50 characters")]
    Username,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("case not found")]
    NotFound,
    #[error(transparent)]
    Upstream(#[from] UpstreamFailure),
    #[error(transparent)]
    Invalid(#[from] CaseValidationError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::Upstream(_) => "upstream_failure",
            Self::Invalid(_) => "validation_error",
            Self::Store(_) => "internal_error",
        }
    }
}

impl NewCase {
    /// Check the bounds the case desk enforces before persisting a case.
    ///
    /// # Errors
    /// Returns the first [`CaseValidationError`] violated by the input.
    pub fn validate(&self) -> Result<(), CaseValidationError> {
        let title_len = self.title.chars().count();
        if !(3..=120).contains(&title_len) {
            return Err(CaseValidationError::Title);
        }

        let words = self.narrative.split_whitespace().count();
        if self.narrative.chars().count() < 5 || !(1..=NARRATIVE_MAX_WORDS).contains(&words) {
            return Err(CaseValidationError::Narrative);
        }

        let locale_len = self.locale.chars().count();
        if !(2..=80).contains(&locale_len) {
            return Err(CaseValidationError::Locale);
        }
        Ok(())
    }
}

/// Validate a username for the user directory.
///
/// # Errors
/// Returns [`CaseValidationError::Username`] when the length is out of bounds.
pub fn validate_username(username: &str) -> Result<(), CaseValidationError> {
    let len = username.trim().chars().count();
    if (3..=50).contains(&len) {
        Ok(())
    } else {
        Err(CaseValidationError::Username)
    }
}

/// Short gloss of a rationale: its first two sentences, period-terminated.
///
/// Falls back to the untouched rationale when it holds no sentence text.
#[must_use]
pub fn plain_language_explanation(rationale: &str) -> String {
    let flattened = rationale.replace('\n', " ");
    let sentences: Vec<&str> = flattened
        .split('.')
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .collect();

    let Some(first) = sentences.first() else {
        return rationale.to_string();
    };

    let mut summary = (*first).to_string();
    if let Some(second) = sentences.get(1) {
        summary.push_str(". ");
        summary.push_str(second);
    }
    if !summary.ends_with('.') {
        summary.push('.');
    }
    summary
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// # Errors
/// Returns an error when the timestamp cannot be rendered as RFC 3339.
pub fn format_rfc3339(value: DateTimeUtc) -> anyhow::Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow::anyhow!("invalid datetime format: {err}"))
}

/// # Errors
/// Returns an error when the value is not an RFC 3339 timestamp.
pub fn parse_rfc3339(value: &str) -> anyhow::Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow::anyhow!("invalid RFC3339 datetime: {err}"))
}
