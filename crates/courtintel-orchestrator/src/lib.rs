#![forbid(unsafe_code)]

use courtintel_domain::{
    validate_username, AuditAction, AuditLogEntry, BiasCheckRecord, BiasCheckView, CaseDetail,
    CaseId, CaseRecord, NewCase, PipelineError, RulingFields, RulingRecord, RulingResult,
    RulingView, UpstreamFailure, UserId, UserRecord, MAX_AUDIT_LOG_LISTING,
};
use courtintel_prompts::{build_bias_prompt, build_ruling_prompt, CaseFacts};
use courtintel_provider::{ModelGateway, BIAS_TEMPERATURE, RULING_TEMPERATURE};
use courtintel_ratelimit::RateGate;
use courtintel_response::{parse_bias_check, parse_ruling};
use courtintel_store_core::{AuditLogSink, CaseStore, RulingStore, UserDirectory};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

/// Two-stage ruling workflow: generate a ruling, then optionally audit it for bias.
///
/// Each stage commits before the next starts. A failed bias audit leaves the
/// ruling of the same run in place.
pub struct RulingPipeline<'a> {
    rate_gate: &'a dyn RateGate,
    gateway: &'a dyn ModelGateway,
    cases: &'a dyn CaseStore,
    rulings: &'a dyn RulingStore,
    audit: &'a dyn AuditLogSink,
}

impl<'a> RulingPipeline<'a> {
    #[must_use]
    pub fn new(
        rate_gate: &'a dyn RateGate,
        gateway: &'a dyn ModelGateway,
        cases: &'a dyn CaseStore,
        rulings: &'a dyn RulingStore,
        audit: &'a dyn AuditLogSink,
    ) -> Self {
        Self {
            rate_gate,
            gateway,
            cases,
            rulings,
            audit,
        }
    }

    /// Generate (or regenerate) the ruling for `case_id` on behalf of `caller`.
    ///
    /// # Errors
    /// Returns [`PipelineError::RateLimited`] when the caller's bucket is empty,
    /// [`PipelineError::NotFound`] when the case is absent or owned by someone
    /// else, [`PipelineError::Upstream`] when either model stage fails, and
    /// [`PipelineError::Store`] when persistence fails.
    pub fn run(
        &self,
        case_id: CaseId,
        caller: UserId,
        bias_check_requested: bool,
    ) -> Result<RulingResult, PipelineError> {
        if !self.rate_gate.try_acquire(&caller.to_string()) {
            warn!(user_id = %caller, "ruling request rate limited");
            return Err(PipelineError::RateLimited);
        }

        let case = load_owned_case(self.cases, case_id, caller)?;
        let ruling = self.generate_ruling(&case, caller)?;

        let bias_check = if bias_check_requested {
            Some(self.audit_ruling(&case, &ruling.record, &ruling.raw, caller)?)
        } else {
            None
        };

        Ok(RulingResult {
            ruling: RulingView::from(&ruling.record),
            bias_check: bias_check.as_ref().map(BiasCheckView::from),
        })
    }

    fn generate_ruling(
        &self,
        case: &CaseRecord,
        caller: UserId,
    ) -> Result<CommittedRuling, PipelineError> {
        let mut extra = Map::new();
        extra.insert(
            "case_id".to_string(),
            Value::String(case.case_id.to_string()),
        );
        let prompt = build_ruling_prompt(
            CaseFacts {
                title: &case.title,
                narrative: &case.narrative,
                locale: &case.locale,
            },
            Some(&extra),
        );
        debug!(
            case_id = %case.case_id,
            gateway = self.gateway.gateway_name(),
            user_chars = prompt.user.len(),
            "ruling prompt built"
        );

        let completion = self
            .gateway
            .complete(&prompt, RULING_TEMPERATURE)
            .map_err(|failure| stage_failed(case.case_id, "ruling", failure))?;
        let validated = parse_ruling(&completion.text)
            .map_err(|failure| stage_failed(case.case_id, "ruling", failure))?;

        let fields = RulingFields {
            verdict: validated.verdict,
            rationale: validated.rationale,
            citations: validated.citations,
            risk_flags: validated.risk_flags,
            model_name: completion.usage.model_name,
            tokens_in: completion.usage.prompt_tokens,
            tokens_out: completion.usage.completion_tokens,
        };
        let record = self.rulings.upsert_ruling(case.case_id, &fields)?;
        info!(
            case_id = %case.case_id,
            ruling_id = %record.ruling_id,
            verdict = %record.verdict,
            model = %record.model_name,
            tokens_in = record.tokens_in,
            tokens_out = record.tokens_out,
            "ruling generated"
        );

        self.audit.append(
            caller,
            AuditAction::RulingGenerated.as_str(),
            Some(&json!({
                "case_id": case.case_id.to_string(),
                "ruling_id": record.ruling_id.to_string(),
                "verdict": record.verdict,
            })),
        )?;

        Ok(CommittedRuling {
            record,
            raw: validated.raw,
        })
    }

    fn audit_ruling(
        &self,
        case: &CaseRecord,
        ruling: &RulingRecord,
        raw_ruling: &Value,
        caller: UserId,
    ) -> Result<BiasCheckRecord, PipelineError> {
        let prompt = build_bias_prompt(raw_ruling);
        let completion = self
            .gateway
            .complete(&prompt, BIAS_TEMPERATURE)
            .map_err(|failure| stage_failed(case.case_id, "bias_check", failure))?;
        let fields = parse_bias_check(&completion.text)
            .map_err(|failure| stage_failed(case.case_id, "bias_check", failure))?;

        let record = self.rulings.upsert_bias_check(ruling.ruling_id, &fields)?;
        info!(
            case_id = %case.case_id,
            ruling_id = %ruling.ruling_id,
            bias_score = record.bias_score,
            model = %completion.usage.model_name,
            tokens_in = completion.usage.prompt_tokens,
            tokens_out = completion.usage.completion_tokens,
            "bias check recorded"
        );

        self.audit.append(
            caller,
            AuditAction::BiasChecked.as_str(),
            Some(&json!({
                "case_id": case.case_id.to_string(),
                "ruling_id": ruling.ruling_id.to_string(),
                "bias_score": record.bias_score,
            })),
        )?;

        Ok(record)
    }
}

struct CommittedRuling {
    record: RulingRecord,
    raw: Value,
}

/// Case bookkeeping around the pipeline: users, cases, detail views and the audit listing.
pub struct CaseDesk<'a> {
    users: &'a dyn UserDirectory,
    cases: &'a dyn CaseStore,
    rulings: &'a dyn RulingStore,
    audit: &'a dyn AuditLogSink,
}

impl<'a> CaseDesk<'a> {
    #[must_use]
    pub fn new(
        users: &'a dyn UserDirectory,
        cases: &'a dyn CaseStore,
        rulings: &'a dyn RulingStore,
        audit: &'a dyn AuditLogSink,
    ) -> Self {
        Self {
            users,
            cases,
            rulings,
            audit,
        }
    }

    /// # Errors
    /// Returns [`PipelineError::Invalid`] for an out-of-bounds name and
    /// [`PipelineError::Store`] when the name is taken or persistence fails.
    pub fn register_user(&self, username: &str) -> Result<UserRecord, PipelineError> {
        validate_username(username)?;
        let user = self.users.register_user(username)?;
        info!(user_id = %user.user_id, "user registered");
        Ok(user)
    }

    /// # Errors
    /// Returns [`PipelineError::NotFound`] when no user has that name.
    pub fn resolve_user(&self, username: &str) -> Result<UserRecord, PipelineError> {
        self.users
            .find_user(username)?
            .ok_or(PipelineError::NotFound)
    }

    /// # Errors
    /// Returns [`PipelineError::Invalid`] when the case fails validation and
    /// [`PipelineError::Store`] when persistence fails.
    pub fn create_case(
        &self,
        caller: UserId,
        new_case: &NewCase,
    ) -> Result<CaseRecord, PipelineError> {
        new_case.validate()?;
        let case = self.cases.insert_case(caller, new_case)?;
        self.audit.append(
            caller,
            AuditAction::CaseCreate.as_str(),
            Some(&json!({
                "case_id": case.case_id.to_string(),
                "title": case.title,
            })),
        )?;
        info!(case_id = %case.case_id, user_id = %caller, "case created");
        Ok(case)
    }

    /// # Errors
    /// Returns [`PipelineError::Store`] when the listing cannot be read.
    pub fn list_cases(&self, caller: UserId) -> Result<Vec<CaseRecord>, PipelineError> {
        Ok(self.cases.list_cases_for_user(caller)?)
    }

    /// Case plus its current ruling and bias check, summary recomputed.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] when the case is absent or foreign.
    pub fn case_detail(
        &self,
        caller: UserId,
        case_id: CaseId,
    ) -> Result<CaseDetail, PipelineError> {
        let case = load_owned_case(self.cases, case_id, caller)?;
        let ruling = self.rulings.get_ruling_for_case(case.case_id)?;
        let bias_check = match &ruling {
            Some(ruling) => self.rulings.get_bias_check_for_ruling(ruling.ruling_id)?,
            None => None,
        };

        Ok(CaseDetail {
            case,
            ruling: ruling.as_ref().map(RulingView::from),
            bias_check: bias_check.as_ref().map(BiasCheckView::from),
        })
    }

    /// Delete a case; its ruling and bias check go with it.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] when the case is absent or foreign.
    pub fn delete_case(&self, caller: UserId, case_id: CaseId) -> Result<(), PipelineError> {
        let case = load_owned_case(self.cases, case_id, caller)?;
        if !self.cases.delete_case(case.case_id)? {
            return Err(PipelineError::NotFound);
        }
        self.audit.append(
            caller,
            AuditAction::CaseDelete.as_str(),
            Some(&json!({ "case_id": case.case_id.to_string() })),
        )?;
        info!(case_id = %case.case_id, user_id = %caller, "case deleted");
        Ok(())
    }

    /// # Errors
    /// Returns [`PipelineError::Store`] when the log cannot be read.
    pub fn list_logs(&self, caller: UserId) -> Result<Vec<AuditLogEntry>, PipelineError> {
        Ok(self.audit.list_for_user(caller, MAX_AUDIT_LOG_LISTING)?)
    }
}

fn load_owned_case(
    cases: &dyn CaseStore,
    case_id: CaseId,
    caller: UserId,
) -> Result<CaseRecord, PipelineError> {
    match cases.get_case(case_id)? {
        Some(case) if case.is_owned_by(caller) => Ok(case),
        Some(_) => {
            debug!(case_id = %case_id, user_id = %caller, "case owned by another user");
            Err(PipelineError::NotFound)
        }
        None => Err(PipelineError::NotFound),
    }
}

fn stage_failed(case_id: CaseId, stage: &'static str, failure: UpstreamFailure) -> PipelineError {
    warn!(case_id = %case_id, stage, error = %failure, "model stage failed");
    PipelineError::Upstream(failure)
}
