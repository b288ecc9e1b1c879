//! # 冷却管理集成测试
//!
//! 覆盖两级作用域的指数退避、清零与读取语义

use chrono::Utc;
use entity::{model_with_providers, models, providers};
use llmio::cooldown::{Category, Manager};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ActiveValue::Set, Database, DatabaseConnection, EntityTrait};

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

async fn insert_assoc(db: &DatabaseConnection) -> model_with_providers::Model {
    let now = Utc::now().naive_utc();
    let provider_id = providers::Entity::insert(providers::ActiveModel {
        name: Set("upstream".to_string()),
        r#type: Set("openai".to_string()),
        config: Set(r#"{"base_url":"http://127.0.0.1:1"}"#.to_string()),
        console: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
        ..Default::default()
    })
    .exec(db)
    .await
    .expect("insert provider")
    .last_insert_id;
    let model_id = models::Entity::insert(models::ActiveModel {
        name: Set("m1".to_string()),
        remark: Set(None),
        max_retry: Set(3),
        time_out: Set(60),
        io_log: Set(false),
        strategy: Set(String::new()),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
        ..Default::default()
    })
    .exec(db)
    .await
    .expect("insert model")
    .last_insert_id;

    let inserted = model_with_providers::Entity::insert(model_with_providers::ActiveModel {
        model_id: Set(model_id),
        provider_id: Set(provider_id),
        provider_model: Set("gpt-4o".to_string()),
        tool_call: Set(false),
        structured_output: Set(false),
        image: Set(false),
        with_header: Set(false),
        status: Set(true),
        customer_headers: Set(None),
        weight: Set(1),
        key_cooldown_until: Set(None),
        key_cooldown_step: Set(0),
        provider_cooldown_until: Set(None),
        provider_cooldown_step: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
        ..Default::default()
    })
    .exec(db)
    .await
    .expect("insert assoc");

    model_with_providers::Entity::find_by_id(inserted.last_insert_id)
        .one(db)
        .await
        .expect("query assoc")
        .expect("assoc exists")
}

async fn reload(
    db: &DatabaseConnection,
    assoc: &model_with_providers::Model,
) -> model_with_providers::Model {
    model_with_providers::Entity::find_by_id(assoc.id)
        .one(db)
        .await
        .expect("query assoc")
        .expect("assoc exists")
}

#[tokio::test]
async fn key_error_bumps_only_key_scope() {
    let (db, _dir) = setup_db().await;
    let assoc = insert_assoc(&db).await;
    let manager = Manager::new(db.clone());

    manager.on_error(&assoc, Category::Key).await.unwrap();

    let updated = reload(&db, &assoc).await;
    assert_eq!(updated.key_cooldown_step, 1);
    assert!(updated.key_cooldown_until.unwrap() > Utc::now().naive_utc());
    assert_eq!(updated.provider_cooldown_step, 0);
    assert!(updated.provider_cooldown_until.is_none());
    assert!(manager.in_cooldown(&updated));
}

#[tokio::test]
async fn provider_error_bumps_only_provider_scope() {
    let (db, _dir) = setup_db().await;
    let assoc = insert_assoc(&db).await;
    let manager = Manager::new(db.clone());

    manager.on_error(&assoc, Category::Provider).await.unwrap();

    let updated = reload(&db, &assoc).await;
    assert_eq!(updated.provider_cooldown_step, 1);
    assert!(updated.provider_cooldown_until.unwrap() > Utc::now().naive_utc());
    assert_eq!(updated.key_cooldown_step, 0);
}

#[tokio::test]
async fn repeated_errors_double_backoff_and_clamp_step() {
    let (db, _dir) = setup_db().await;
    let mut assoc = insert_assoc(&db).await;
    let manager = Manager::new(db.clone());

    for expected_step in 1..=12 {
        let before_call = Utc::now().naive_utc();
        manager.on_error(&assoc, Category::Provider).await.unwrap();
        assoc = reload(&db, &assoc).await;
        assert_eq!(assoc.provider_cooldown_step, expected_step.min(8));
        let until = assoc.provider_cooldown_until.unwrap();
        // 冷却截止时间始终在调用时刻之后，且不超过上限 5 分钟
        assert!(until > before_call);
        assert!(until <= before_call + chrono::Duration::seconds(301));
    }
}

#[tokio::test]
async fn client_and_none_categories_are_noops() {
    let (db, _dir) = setup_db().await;
    let assoc = insert_assoc(&db).await;
    let manager = Manager::new(db.clone());

    manager.on_error(&assoc, Category::Client).await.unwrap();
    manager.on_error(&assoc, Category::None).await.unwrap();

    let updated = reload(&db, &assoc).await;
    assert_eq!(updated.key_cooldown_step, 0);
    assert_eq!(updated.provider_cooldown_step, 0);
    assert!(!manager.in_cooldown(&updated));
}

#[tokio::test]
async fn success_resets_both_scopes_in_one_update() {
    let (db, _dir) = setup_db().await;
    let mut assoc = insert_assoc(&db).await;
    let manager = Manager::new(db.clone());

    manager.on_error(&assoc, Category::Key).await.unwrap();
    assoc = reload(&db, &assoc).await;
    manager.on_error(&assoc, Category::Provider).await.unwrap();
    assoc = reload(&db, &assoc).await;
    assert!(manager.in_cooldown(&assoc));

    manager.on_success(&assoc).await.unwrap();

    let updated = reload(&db, &assoc).await;
    assert_eq!(updated.key_cooldown_step, 0);
    assert_eq!(updated.provider_cooldown_step, 0);
    assert!(updated.key_cooldown_until.is_none());
    assert!(updated.provider_cooldown_until.is_none());
    assert!(!manager.in_cooldown(&updated));
}
