#![forbid(unsafe_code)]

use anyhow::Result;
use courtintel_domain::{
    AuditLogEntry, BiasCheckFields, BiasCheckRecord, CaseId, CaseRecord, NewCase, RulingFields,
    RulingId, RulingRecord, UserId, UserRecord,
};

pub trait UserDirectory {
    #[allow(clippy::missing_errors_doc)]
    fn register_user(&self, username: &str) -> Result<UserRecord>;

    #[allow(clippy::missing_errors_doc)]
    fn find_user(&self, username: &str) -> Result<Option<UserRecord>>;
}

/// Case persistence. Ownership checks belong to callers; lookups here are by id only.
pub trait CaseStore {
    #[allow(clippy::missing_errors_doc)]
    fn insert_case(&self, owner: UserId, case: &NewCase) -> Result<CaseRecord>;

    #[allow(clippy::missing_errors_doc)]
    fn get_case(&self, case_id: CaseId) -> Result<Option<CaseRecord>>;

    /// Cases owned by `owner`, newest first.
    #[allow(clippy::missing_errors_doc)]
    fn list_cases_for_user(&self, owner: UserId) -> Result<Vec<CaseRecord>>;

    /// Delete a case together with its ruling and bias check. Returns whether a row was removed.
    #[allow(clippy::missing_errors_doc)]
    fn delete_case(&self, case_id: CaseId) -> Result<bool>;
}

/// At most one ruling per case and one bias check per ruling; upserts keep
/// the existing identity and `created_at`.
pub trait RulingStore {
    #[allow(clippy::missing_errors_doc)]
    fn get_ruling_for_case(&self, case_id: CaseId) -> Result<Option<RulingRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn upsert_ruling(&self, case_id: CaseId, fields: &RulingFields) -> Result<RulingRecord>;

    #[allow(clippy::missing_errors_doc)]
    fn get_bias_check_for_ruling(&self, ruling_id: RulingId) -> Result<Option<BiasCheckRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn upsert_bias_check(
        &self,
        ruling_id: RulingId,
        fields: &BiasCheckFields,
    ) -> Result<BiasCheckRecord>;
}

/// Append-only audit trail.
pub trait AuditLogSink {
    #[allow(clippy::missing_errors_doc)]
    fn append(
        &self,
        user_id: UserId,
        action: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<AuditLogEntry>;

    /// Newest entries first, at most `limit`.
    #[allow(clippy::missing_errors_doc)]
    fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<AuditLogEntry>>;
}
