//! # 调度核心集成测试
//!
//! 本地起一个模拟上游，覆盖候选过滤、冷却闸门、按类别降权/摘除与重试预算

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use chrono::{Duration as ChronoDuration, Utc};
use entity::{chat_logs, model_with_providers, models, provider_keys, providers};
use llmio::service::{Before, balance_chat, providers_with_meta_by_model_name};
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::net::TcpListener;

async fn setup_db() -> (DatabaseConnection, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("test.db");
    std::fs::File::create(&path).expect("create db file");
    let db = Database::connect(format!("sqlite://{}", path.display()))
        .await
        .expect("connect sqlite");
    Migrator::up(&db, None).await.expect("run migrations");
    (db, dir)
}

/// 模拟上游：前 fail_first 个请求返回 fail_status，之后返回 200
#[derive(Clone)]
struct UpstreamState {
    hits: Arc<AtomicUsize>,
    fail_first: usize,
    fail_status: StatusCode,
}

async fn upstream_handler(State(state): State<UpstreamState>, _body: String) -> (StatusCode, String) {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    if hit < state.fail_first {
        return (state.fail_status, r#"{"error":{"message":"upstream unhappy"}}"#.to_string());
    }
    (
        StatusCode::OK,
        r#"{"id":"chatcmpl-1","usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#
            .to_string(),
    )
}

async fn spawn_upstream(fail_first: usize, fail_status: StatusCode) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/v1/chat/completions", post(upstream_handler))
        .with_state(UpstreamState {
            hits: hits.clone(),
            fail_first,
            fail_status,
        });
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });
    (format!("http://{addr}/v1"), hits)
}

async fn insert_provider(db: &DatabaseConnection, name: &str, base_url: &str) -> i32 {
    let now = Utc::now().naive_utc();
    providers::Entity::insert(providers::ActiveModel {
        name: Set(name.to_string()),
        r#type: Set("openai".to_string()),
        config: Set(format!(r#"{{"base_url":"{base_url}"}}"#)),
        console: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
        ..Default::default()
    })
    .exec(db)
    .await
    .expect("insert provider")
    .last_insert_id
}

async fn insert_model(db: &DatabaseConnection, name: &str, max_retry: i32) -> i32 {
    let now = Utc::now().naive_utc();
    models::Entity::insert(models::ActiveModel {
        name: Set(name.to_string()),
        remark: Set(None),
        max_retry: Set(max_retry),
        time_out: Set(30),
        io_log: Set(false),
        // rotor 按 id 升序确定性轮转，便于断言
        strategy: Set("rotor".to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
        ..Default::default()
    })
    .exec(db)
    .await
    .expect("insert model")
    .last_insert_id
}

struct AssocSpec {
    tool_call: bool,
    weight: i32,
    provider_cooldown_until: Option<chrono::NaiveDateTime>,
}

impl Default for AssocSpec {
    fn default() -> Self {
        Self {
            tool_call: false,
            weight: 1,
            provider_cooldown_until: None,
        }
    }
}

async fn insert_assoc(
    db: &DatabaseConnection,
    model_id: i32,
    provider_id: i32,
    spec: AssocSpec,
) -> i32 {
    let now = Utc::now().naive_utc();
    model_with_providers::Entity::insert(model_with_providers::ActiveModel {
        model_id: Set(model_id),
        provider_id: Set(provider_id),
        provider_model: Set("gpt-4o-mini".to_string()),
        tool_call: Set(spec.tool_call),
        structured_output: Set(false),
        image: Set(false),
        with_header: Set(false),
        status: Set(true),
        customer_headers: Set(None),
        weight: Set(spec.weight),
        key_cooldown_until: Set(None),
        key_cooldown_step: Set(0),
        provider_cooldown_until: Set(spec.provider_cooldown_until),
        provider_cooldown_step: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
        ..Default::default()
    })
    .exec(db)
    .await
    .expect("insert assoc")
    .last_insert_id
}

async fn insert_key(db: &DatabaseConnection, provider_id: i32, key: &str) -> i32 {
    let now = Utc::now().naive_utc();
    provider_keys::Entity::insert(provider_keys::ActiveModel {
        provider_id: Set(provider_id),
        key: Set(key.to_string()),
        remark: Set(None),
        enabled: Set(true),
        cooldown_until: Set(None),
        cooldown_step: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
        ..Default::default()
    })
    .exec(db)
    .await
    .expect("insert key")
    .last_insert_id
}

fn before_for(model: &str, tool_call: bool) -> Before {
    let raw = if tool_call {
        format!(
            r#"{{"model":"{model}","messages":[{{"role":"user","content":"hi"}}],"tools":[{{"type":"function"}}]}}"#
        )
    } else {
        format!(r#"{{"model":"{model}","messages":[{{"role":"user","content":"hi"}}]}}"#)
    };
    llmio::service::before::before_openai(raw.into_bytes().into()).expect("parse before")
}

#[tokio::test]
async fn missing_model_fails_and_leaves_an_error_log() {
    let (db, _dir) = setup_db().await;
    let before = before_for("ghost", false);

    let err = providers_with_meta_by_model_name(&db, "openai", &before)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found model ghost"));

    let logs = chat_logs::Entity::find()
        .filter(chat_logs::Column::Status.eq("error"))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].name, "ghost");
}

#[tokio::test]
async fn no_surviving_association_fails() {
    let (db, _dir) = setup_db().await;
    insert_model(&db, "m1", 3).await;

    let before = before_for("m1", false);
    let err = providers_with_meta_by_model_name(&db, "openai", &before)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not provider for model m1"));
}

#[tokio::test]
async fn capability_filter_is_conjunctive() {
    let (db, _dir) = setup_db().await;
    let (base_url, _hits) = spawn_upstream(0, StatusCode::OK).await;
    let provider_id = insert_provider(&db, "p1", &base_url).await;
    let model_id = insert_model(&db, "m1", 3).await;
    let with_tools = insert_assoc(
        &db,
        model_id,
        provider_id,
        AssocSpec {
            tool_call: true,
            weight: 1,
            ..AssocSpec::default()
        },
    )
    .await;
    // 大权重但不具备工具调用能力，带工具请求永远不该命中它
    insert_assoc(
        &db,
        model_id,
        provider_id,
        AssocSpec {
            tool_call: false,
            weight: 100,
            ..AssocSpec::default()
        },
    )
    .await;

    let before = before_for("m1", true);
    let meta = providers_with_meta_by_model_name(&db, "openai", &before)
        .await
        .unwrap();
    assert_eq!(meta.associations.len(), 1);
    assert!(meta.associations.contains_key(&with_tools));
    assert_eq!(meta.weights.len(), 1);
}

#[tokio::test]
async fn all_providers_in_cooldown_fails_without_upstream_calls() {
    let (db, _dir) = setup_db().await;
    let (base_url, hits) = spawn_upstream(0, StatusCode::OK).await;
    let provider_id = insert_provider(&db, "p1", &base_url).await;
    let model_id = insert_model(&db, "m1", 5).await;
    let future = Utc::now().naive_utc() + ChronoDuration::seconds(120);
    for _ in 0..2 {
        insert_assoc(
            &db,
            model_id,
            provider_id,
            AssocSpec {
                provider_cooldown_until: Some(future),
                ..AssocSpec::default()
            },
        )
        .await;
    }

    let before = before_for("m1", false);
    let meta = providers_with_meta_by_model_name(&db, "openai", &before)
        .await
        .unwrap();
    let err = balance_chat(
        &db,
        Instant::now(),
        "openai",
        &before,
        &meta,
        &llmio::service::ReqMeta::default(),
        1,
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("all providers are in cooldown"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn provider_error_evicts_candidate_and_cools_provider_scope() {
    let (db, _dir) = setup_db().await;
    // 第一个上游一直 503，第二个上游正常
    let (bad_url, bad_hits) = spawn_upstream(usize::MAX, StatusCode::SERVICE_UNAVAILABLE).await;
    let (good_url, good_hits) = spawn_upstream(0, StatusCode::OK).await;
    let bad_provider = insert_provider(&db, "bad", &bad_url).await;
    let good_provider = insert_provider(&db, "good", &good_url).await;
    let model_id = insert_model(&db, "m1", 3).await;
    let bad_assoc = insert_assoc(&db, model_id, bad_provider, AssocSpec::default()).await;
    insert_assoc(&db, model_id, good_provider, AssocSpec::default()).await;

    let before = before_for("m1", false);
    let meta = providers_with_meta_by_model_name(&db, "openai", &before)
        .await
        .unwrap();
    let (response, log_id, _ctx) = balance_chat(
        &db,
        Instant::now(),
        "openai",
        &before,
        &meta,
        &llmio::service::ReqMeta::default(),
        1,
    )
    .await
    .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert!(log_id > 0);
    // rotor 先命中 id 较小的 bad 渠道，503 后摘除并冷却，随后路由到 good
    assert_eq!(bad_hits.load(Ordering::SeqCst), 1);
    assert_eq!(good_hits.load(Ordering::SeqCst), 1);

    let cooled = model_with_providers::Entity::find_by_id(bad_assoc)
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cooled.provider_cooldown_step, 1);
    assert!(cooled.provider_cooldown_until.unwrap() > Utc::now().naive_utc());

    // 成功日志记录了第二次尝试
    let log = chat_logs::Entity::find_by_id(log_id)
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.status, "success");
    assert_eq!(log.retry, 2);
    assert_eq!(log.provider_name.as_deref(), Some("good"));
}

#[tokio::test]
async fn key_error_demotes_without_evicting_and_cools_the_key() {
    let (db, _dir) = setup_db().await;
    // 首个请求 429，之后 200，单渠道双密钥
    let (base_url, hits) = spawn_upstream(1, StatusCode::TOO_MANY_REQUESTS).await;
    // 密钥池游标按 provider_id 全局共享，垫高 id 与其它并行测试隔离
    for n in 0..20 {
        insert_provider(&db, &format!("pad-{n}"), &base_url).await;
    }
    let provider_id = insert_provider(&db, "p1", &base_url).await;
    let model_id = insert_model(&db, "m1", 3).await;
    insert_assoc(&db, model_id, provider_id, AssocSpec::default()).await;
    let first_key = insert_key(&db, provider_id, "sk-first").await;
    let second_key = insert_key(&db, provider_id, "sk-second").await;

    let before = before_for("m1", false);
    let meta = providers_with_meta_by_model_name(&db, "openai", &before)
        .await
        .unwrap();
    let (response, log_id, ctx) = balance_chat(
        &db,
        Instant::now(),
        "openai",
        &before,
        &meta,
        &llmio::service::ReqMeta::default(),
        1,
    )
    .await
    .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // 429 的那把密钥被冷却，成功尝试换用了另一把
    let keys = provider_keys::Entity::find()
        .filter(provider_keys::Column::ProviderId.eq(provider_id))
        .all(&db)
        .await
        .unwrap();
    let cooled: Vec<_> = keys.iter().filter(|key| key.cooldown_step > 0).collect();
    assert_eq!(cooled.len(), 1);
    assert!(cooled[0].cooldown_until.unwrap() > Utc::now().naive_utc());
    assert!(ctx.key_id == first_key || ctx.key_id == second_key);
    assert_ne!(ctx.key_id, cooled[0].id);

    let log = chat_logs::Entity::find_by_id(log_id)
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.retry, 2);
    assert_eq!(log.provider_key_id, ctx.key_id);
}

#[tokio::test]
async fn upstream_calls_never_exceed_retry_budget() {
    let (db, _dir) = setup_db().await;
    let (base_url, hits) = spawn_upstream(usize::MAX, StatusCode::TOO_MANY_REQUESTS).await;
    let provider_id = insert_provider(&db, "p1", &base_url).await;
    let model_id = insert_model(&db, "m1", 2).await;
    insert_assoc(&db, model_id, provider_id, AssocSpec::default()).await;

    let before = before_for("m1", false);
    let meta = providers_with_meta_by_model_name(&db, "openai", &before)
        .await
        .unwrap();
    let err = balance_chat(
        &db,
        Instant::now(),
        "openai",
        &before,
        &meta,
        &llmio::service::ReqMeta::default(),
        1,
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("maximum retry attempts reached"));
    // 429 走降权保留，尝试次数正好耗尽预算
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // 每次失败都留了一条重试日志
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let error_logs = chat_logs::Entity::find()
        .filter(chat_logs::Column::Status.eq("error"))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(error_logs.len(), 2);
}

#[tokio::test]
async fn zero_max_retry_is_clamped_to_one_attempt() {
    let (db, _dir) = setup_db().await;
    let (base_url, hits) = spawn_upstream(usize::MAX, StatusCode::SERVICE_UNAVAILABLE).await;
    let provider_id = insert_provider(&db, "p1", &base_url).await;
    let model_id = insert_model(&db, "m1", 0).await;
    insert_assoc(&db, model_id, provider_id, AssocSpec::default()).await;

    let before = before_for("m1", false);
    let meta = providers_with_meta_by_model_name(&db, "openai", &before)
        .await
        .unwrap();
    let result = balance_chat(
        &db,
        Instant::now(),
        "openai",
        &before,
        &meta,
        &llmio::service::ReqMeta::default(),
        1,
    )
    .await;

    assert!(result.is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn with_header_passthrough_controls_header_set() {
    let (db, _dir) = setup_db().await;
    let mut source = HeaderMap::new();
    source.insert("x-trace", "abc".parse().unwrap());
    source.insert("authorization", "Bearer secret".parse().unwrap());

    let kept = llmio::service::build_headers(&source, true, &Default::default(), false);
    assert_eq!(kept.get("x-trace").unwrap(), "abc");
    assert!(kept.get("authorization").is_none());

    let dropped = llmio::service::build_headers(&source, false, &Default::default(), false);
    assert!(dropped.get("x-trace").is_none());

    let _ = db;
}
