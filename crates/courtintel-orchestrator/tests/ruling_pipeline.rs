use courtintel_domain::{CaseId, NewCase, PipelineError, UpstreamFailure, UserId};
use courtintel_orchestrator::{CaseDesk, RulingPipeline};
use courtintel_provider::{ScriptedGateway, BIAS_TEMPERATURE, RULING_TEMPERATURE};
use courtintel_ratelimit::{RateLimitPolicy, TokenBucketLimiter};
use courtintel_store_sqlite::SqliteCourtStore;
use ulid::Ulid;

const STOP_SIGN_RULING: &str = r#"{
    "verdict": "reduced",
    "rationale": "The driver reports a full stop. The officer observed a rolling stop. The record shows no prior violations. A reduced fine is proportionate.",
    "citations": ["Cal. Vehicle Code 22450"],
    "risk_flags": []
}"#;

const STOP_SIGN_BIAS: &str = r#"{"bias_score": 0.2, "notes": ["Relies on officer account"]}"#;

fn temp_db_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "courtintel-pipeline-test-{}-{}.sqlite",
        name,
        Ulid::new()
    ))
}

fn fresh_store(name: &str) -> SqliteCourtStore {
    let store = SqliteCourtStore::open_and_migrate(&temp_db_path(name));
    assert!(store.is_ok());
    store.unwrap_or_else(|_| unreachable!())
}

fn roomy_limiter() -> TokenBucketLimiter {
    TokenBucketLimiter::new(RateLimitPolicy {
        rate_per_second: 0.0,
        capacity: 100.0,
    })
}

fn stop_sign() -> NewCase {
    NewCase {
        title: "Stop sign".to_string(),
        narrative: "I stopped but the officer said I rolled through the stop sign.".to_string(),
        locale: "California".to_string(),
    }
}

fn user_with_case(store: &SqliteCourtStore, username: &str) -> (UserId, CaseId) {
    let desk = CaseDesk::new(store, store, store, store);
    let user = desk
        .register_user(username)
        .unwrap_or_else(|_| unreachable!());
    let case = desk
        .create_case(user.user_id, &stop_sign())
        .unwrap_or_else(|_| unreachable!());
    (user.user_id, case.case_id)
}

#[test]
fn stop_sign_case_yields_ruling_bias_check_and_two_audit_entries() {
    let store = fresh_store("end-to-end");
    let (judge, case_id) = user_with_case(&store, "judge");
    let limiter = TokenBucketLimiter::default();
    let gateway = ScriptedGateway::new("gpt-4o-mini")
        .with_reply(STOP_SIGN_RULING)
        .with_reply(STOP_SIGN_BIAS);
    let pipeline = RulingPipeline::new(&limiter, &gateway, &store, &store, &store);

    let result = pipeline.run(case_id, judge, true);
    assert!(result.is_ok());
    let result = result.unwrap_or_else(|_| unreachable!());

    assert_eq!(result.ruling.verdict, "reduced");
    assert_eq!(
        result.ruling.plain_explanation,
        "The driver reports a full stop. The officer observed a rolling stop."
    );
    assert_eq!(result.ruling.citations, vec!["Cal. Vehicle Code 22450"]);
    assert_eq!(result.ruling.model_name, "gpt-4o-mini");
    assert!(result.ruling.tokens_in > 0);
    let bias = result.bias_check.unwrap_or_else(|| unreachable!());
    assert!((bias.bias_score - 0.2).abs() < f64::EPSILON);
    assert_eq!(bias.notes, vec!["Relies on officer account"]);

    let calls = gateway.calls();
    assert_eq!(calls.len(), 2);
    assert!((calls[0].temperature - RULING_TEMPERATURE).abs() < f64::EPSILON);
    assert!(calls[0].prompt.user.contains("Case title: Stop sign"));
    assert!(calls[0]
        .prompt
        .user
        .contains(&format!("Additional context:\ncase_id: {case_id}")));
    assert!((calls[1].temperature - BIAS_TEMPERATURE).abs() < f64::EPSILON);
    assert!(calls[1].prompt.user.contains("\"verdict\":\"reduced\""));

    let desk = CaseDesk::new(&store, &store, &store, &store);
    let logs = desk.list_logs(judge).unwrap_or_else(|_| unreachable!());
    let actions: Vec<&str> = logs.iter().map(|entry| entry.action.as_str()).collect();
    assert_eq!(actions, vec!["bias_checked", "ruling_generated", "case_create"]);

    let generated = &logs[1];
    let metadata = generated.metadata.clone().unwrap_or_else(|| unreachable!());
    assert_eq!(metadata["case_id"], case_id.to_string());
    assert_eq!(metadata["verdict"], "reduced");
    let checked = logs[0].metadata.clone().unwrap_or_else(|| unreachable!());
    assert_eq!(checked["ruling_id"], metadata["ruling_id"]);
    assert_eq!(checked["bias_score"], 0.2);

    let detail = desk
        .case_detail(judge, case_id)
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(detail.ruling.map(|ruling| ruling.verdict), Some("reduced".to_string()));
    assert!(detail.bias_check.is_some());
}

#[test]
fn other_users_see_not_found_for_foreign_cases() {
    let store = fresh_store("ownership");
    let (_, case_id) = user_with_case(&store, "owner");
    let desk = CaseDesk::new(&store, &store, &store, &store);
    let intruder = desk
        .register_user("intruder")
        .unwrap_or_else(|_| unreachable!());

    assert!(matches!(
        desk.case_detail(intruder.user_id, case_id),
        Err(PipelineError::NotFound)
    ));
    assert!(matches!(
        desk.delete_case(intruder.user_id, case_id),
        Err(PipelineError::NotFound)
    ));

    let limiter = roomy_limiter();
    let gateway = ScriptedGateway::default().with_reply(STOP_SIGN_RULING);
    let pipeline = RulingPipeline::new(&limiter, &gateway, &store, &store, &store);
    assert!(matches!(
        pipeline.run(case_id, intruder.user_id, false),
        Err(PipelineError::NotFound)
    ));
    assert!(matches!(
        pipeline.run(CaseId::new(), intruder.user_id, false),
        Err(PipelineError::NotFound)
    ));
    assert!(gateway.calls().is_empty());
    assert!(desk
        .list_logs(intruder.user_id)
        .unwrap_or_else(|_| unreachable!())
        .is_empty());
}

#[test]
fn rerunning_a_case_overwrites_the_single_ruling() {
    let store = fresh_store("upsert");
    let (judge, case_id) = user_with_case(&store, "judge");
    let limiter = roomy_limiter();
    let gateway = ScriptedGateway::default()
        .with_reply(STOP_SIGN_RULING)
        .with_reply(
            r#"{"verdict": "dismissed", "rationale": "The sign was obstructed. No violation occurred.", "citations": []}"#,
        );
    let pipeline = RulingPipeline::new(&limiter, &gateway, &store, &store, &store);

    let first = pipeline
        .run(case_id, judge, false)
        .unwrap_or_else(|_| unreachable!());
    let second = pipeline
        .run(case_id, judge, false)
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(first.ruling.verdict, "reduced");
    assert_eq!(second.ruling.verdict, "dismissed");
    assert_eq!(first.ruling.created_at, second.ruling.created_at);
    assert!(second.bias_check.is_none());

    let desk = CaseDesk::new(&store, &store, &store, &store);
    let detail = desk
        .case_detail(judge, case_id)
        .unwrap_or_else(|_| unreachable!());
    let ruling = detail.ruling.unwrap_or_else(|| unreachable!());
    assert_eq!(ruling.verdict, "dismissed");
    assert!(ruling.citations.is_empty());
    assert_eq!(
        ruling.plain_explanation,
        "The sign was obstructed. No violation occurred."
    );

    let logs = desk.list_logs(judge).unwrap_or_else(|_| unreachable!());
    let ruling_ids: Vec<_> = logs
        .iter()
        .filter(|entry| entry.action == "ruling_generated")
        .filter_map(|entry| entry.metadata.as_ref().map(|meta| meta["ruling_id"].clone()))
        .collect();
    assert_eq!(ruling_ids.len(), 2);
    assert_eq!(ruling_ids[0], ruling_ids[1]);
}

#[test]
fn failed_bias_audit_keeps_the_committed_ruling() {
    let store = fresh_store("bias-failure");
    let (judge, case_id) = user_with_case(&store, "judge");
    let limiter = roomy_limiter();
    let gateway = ScriptedGateway::default()
        .with_reply(STOP_SIGN_RULING)
        .with_failure(UpstreamFailure::Status { status: 502 });
    let pipeline = RulingPipeline::new(&limiter, &gateway, &store, &store, &store);

    let result = pipeline.run(case_id, judge, true);
    assert!(matches!(
        result,
        Err(PipelineError::Upstream(UpstreamFailure::Status { status: 502 }))
    ));

    let desk = CaseDesk::new(&store, &store, &store, &store);
    let detail = desk
        .case_detail(judge, case_id)
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(detail.ruling.map(|ruling| ruling.verdict), Some("reduced".to_string()));
    assert!(detail.bias_check.is_none());

    let actions: Vec<String> = desk
        .list_logs(judge)
        .unwrap_or_else(|_| unreachable!())
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    assert_eq!(actions, vec!["ruling_generated", "case_create"]);
}

#[test]
fn incomplete_bias_output_is_rejected_after_ruling_commit() {
    let store = fresh_store("bias-incomplete");
    let (judge, case_id) = user_with_case(&store, "judge");
    let limiter = roomy_limiter();
    let gateway = ScriptedGateway::default()
        .with_reply(STOP_SIGN_RULING)
        .with_reply(r#"{"notes": ["no score given"]}"#);
    let pipeline = RulingPipeline::new(&limiter, &gateway, &store, &store, &store);

    assert!(matches!(
        pipeline.run(case_id, judge, true),
        Err(PipelineError::Upstream(UpstreamFailure::Incomplete("bias_score")))
    ));
    let desk = CaseDesk::new(&store, &store, &store, &store);
    let detail = desk
        .case_detail(judge, case_id)
        .unwrap_or_else(|_| unreachable!());
    assert!(detail.ruling.is_some());
    assert!(detail.bias_check.is_none());
}

#[test]
fn failed_ruling_stage_persists_and_logs_nothing() {
    let store = fresh_store("ruling-failure");
    let (judge, case_id) = user_with_case(&store, "judge");
    let limiter = roomy_limiter();
    let gateway = ScriptedGateway::default()
        .with_reply("The verdict is reduced.")
        .with_reply(r#"{"verdict": "upheld"}"#)
        .with_failure(UpstreamFailure::EmptyResponse);
    let pipeline = RulingPipeline::new(&limiter, &gateway, &store, &store, &store);

    assert!(matches!(
        pipeline.run(case_id, judge, true),
        Err(PipelineError::Upstream(UpstreamFailure::Unparseable(_)))
    ));
    assert!(matches!(
        pipeline.run(case_id, judge, true),
        Err(PipelineError::Upstream(UpstreamFailure::Incomplete("rationale")))
    ));
    assert!(matches!(
        pipeline.run(case_id, judge, true),
        Err(PipelineError::Upstream(UpstreamFailure::EmptyResponse))
    ));
    assert_eq!(gateway.calls().len(), 3);

    let desk = CaseDesk::new(&store, &store, &store, &store);
    let detail = desk
        .case_detail(judge, case_id)
        .unwrap_or_else(|_| unreachable!());
    assert!(detail.ruling.is_none());
    let logs = desk.list_logs(judge).unwrap_or_else(|_| unreachable!());
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].action, "case_create");
}

#[test]
fn default_limiter_allows_a_burst_of_three_per_user() {
    let store = fresh_store("burst");
    let (judge, case_id) = user_with_case(&store, "judge");
    let (clerk, clerk_case) = user_with_case(&store, "clerk");
    let limiter = TokenBucketLimiter::default();
    let gateway = ScriptedGateway::default();
    for _ in 0..4 {
        gateway.push_reply(STOP_SIGN_RULING);
    }
    let pipeline = RulingPipeline::new(&limiter, &gateway, &store, &store, &store);

    for _ in 0..3 {
        assert!(pipeline.run(case_id, judge, false).is_ok());
    }
    assert!(matches!(
        pipeline.run(case_id, judge, false),
        Err(PipelineError::RateLimited)
    ));
    assert!(pipeline.run(clerk_case, clerk, false).is_ok());
    assert_eq!(gateway.remaining(), 0);
}

#[test]
fn deleting_a_case_removes_its_ruling_and_logs_the_delete() {
    let store = fresh_store("delete");
    let (judge, case_id) = user_with_case(&store, "judge");
    let limiter = roomy_limiter();
    let gateway = ScriptedGateway::default()
        .with_reply(STOP_SIGN_RULING)
        .with_reply(STOP_SIGN_BIAS);
    let pipeline = RulingPipeline::new(&limiter, &gateway, &store, &store, &store);
    assert!(pipeline.run(case_id, judge, true).is_ok());

    let desk = CaseDesk::new(&store, &store, &store, &store);
    assert!(desk.delete_case(judge, case_id).is_ok());
    assert!(matches!(
        desk.case_detail(judge, case_id),
        Err(PipelineError::NotFound)
    ));
    assert!(desk
        .list_cases(judge)
        .unwrap_or_else(|_| unreachable!())
        .is_empty());

    let logs = desk.list_logs(judge).unwrap_or_else(|_| unreachable!());
    assert_eq!(logs[0].action, "case_delete");
    assert_eq!(logs.len(), 4);
}
