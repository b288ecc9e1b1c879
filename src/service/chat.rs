//! 调度核心：候选查询、加权选取、冷却闸门、重试循环与上游调用

use crate::balancer::build_balancer;
use crate::consts;
use crate::cooldown::{self, Category};
use crate::error::{ProxyError, Result};
use crate::key_pool;
use crate::logging::{LogComponent, LogStage};
use crate::providers::{ProviderConfig, build_chat_request};
use crate::service::before::Before;
use crate::service::record::{ChatLogRow, record_retry_logs, save_chat_log};
use crate::{ldebug, linfo, lwarn};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use entity::{model_with_providers, models, providers as providers_entity};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// 入站请求的元信息
#[derive(Debug, Clone, Default)]
pub struct ReqMeta {
    pub user_agent: Option<String>,
    pub remote_ip: Option<String>,
    pub header: HeaderMap,
}

/// 候选查询结果：模型元数据加可用的关联/渠道集合
#[derive(Debug, Clone)]
pub struct ProvidersWithMeta {
    pub associations: HashMap<i32, model_with_providers::Model>,
    pub weights: HashMap<i32, i32>,
    pub providers: HashMap<i32, providers_entity::Model>,
    pub max_retry: i32,
    pub time_out: i32,
    pub io_log: bool,
    pub strategy: String,
}

/// 每次命中上游后随请求传递的边车，供异步流处理回写冷却与密钥反馈
#[derive(Clone, Debug)]
pub struct StreamContext {
    pub assoc: model_with_providers::Model,
    pub cooldown: Arc<cooldown::Manager>,
    pub key_pool: Arc<key_pool::Pool>,
    pub key_id: i32,
}

/// 候选查询。模型缺失时留痕一条错误日志再报错；
/// 能力过滤是合取条件，请求要求的能力逐项收紧候选集
pub async fn providers_with_meta_by_model_name(
    db: &DatabaseConnection,
    style: &str,
    before: &Before,
) -> Result<ProvidersWithMeta> {
    let Some(model) = models::Entity::find()
        .filter(models::Column::Name.eq(&before.model))
        .filter(models::Column::DeletedAt.is_null())
        .one(db)
        .await?
    else {
        save_chat_log(
            db,
            ChatLogRow {
                name: before.model.clone(),
                status: "error".to_string(),
                style: style.to_string(),
                error: Some("record not found".to_string()),
                ..ChatLogRow::default()
            },
        )
        .await?;
        return Err(ProxyError::business(format!(
            "not found model {}",
            before.model
        )));
    };

    let mut assoc_query = model_with_providers::Entity::find()
        .filter(model_with_providers::Column::ModelId.eq(model.id))
        .filter(model_with_providers::Column::Status.eq(true))
        .filter(model_with_providers::Column::DeletedAt.is_null());
    if before.tool_call {
        assoc_query = assoc_query.filter(model_with_providers::Column::ToolCall.eq(true));
    }
    if before.structured_output {
        assoc_query = assoc_query.filter(model_with_providers::Column::StructuredOutput.eq(true));
    }
    if before.image {
        assoc_query = assoc_query.filter(model_with_providers::Column::Image.eq(true));
    }
    let associations = assoc_query.all(db).await?;

    if associations.is_empty() {
        return Err(ProxyError::business(format!(
            "not provider for model {}",
            before.model
        )));
    }

    let provider_ids: Vec<i32> = associations.iter().map(|assoc| assoc.provider_id).collect();
    let provider_rows = providers_entity::Entity::find()
        .filter(providers_entity::Column::Id.is_in(provider_ids))
        .filter(providers_entity::Column::Type.eq(style))
        .filter(providers_entity::Column::DeletedAt.is_null())
        .all(db)
        .await?;
    let providers: HashMap<i32, providers_entity::Model> = provider_rows
        .into_iter()
        .map(|provider| (provider.id, provider))
        .collect();

    let mut assoc_map = HashMap::with_capacity(associations.len());
    let mut weights = HashMap::new();
    for assoc in associations {
        if providers.contains_key(&assoc.provider_id) {
            weights.insert(assoc.id, assoc.weight);
        }
        assoc_map.insert(assoc.id, assoc);
    }

    Ok(ProvidersWithMeta {
        associations: assoc_map,
        weights,
        providers,
        max_retry: model.max_retry,
        time_out: model.time_out,
        io_log: model.io_log,
        strategy: model.strategy,
    })
}

/// 负载均衡转发。在整体重试预算内循环选取候选，
/// 对失败按类别做冷却/密钥反馈与降权/摘除，命中 200 即落一条成功日志并返回
pub async fn balance_chat(
    db: &DatabaseConnection,
    start: Instant,
    style: &str,
    before: &Before,
    meta: &ProvidersWithMeta,
    req_meta: &ReqMeta,
    auth_key_id: i32,
) -> Result<(reqwest::Response, i32, StreamContext)> {
    linfo!(
        "dispatch",
        LogStage::Scheduling,
        LogComponent::Dispatcher,
        "request",
        "dispatching chat request",
        model = %before.model,
        stream = before.stream,
        tool_call = before.tool_call,
        structured_output = before.structured_output,
        image = before.image
    );

    let mut active_providers = meta.weights.len();
    if active_providers == 0 {
        active_providers = meta.associations.len();
    }
    if active_providers == 0 {
        return Err(ProxyError::business("no active providers"));
    }

    let cooldown_manager = Arc::new(cooldown::Manager::new(db.clone()));
    let pool = Arc::new(key_pool::Pool::new(db.clone()));

    let retries = meta.max_retry.max(1);

    // 收集重试过程中的失败日志，后台落库，发送永不阻塞热路径
    let (retry_log, retry_log_rx) = mpsc::channel::<ChatLogRow>(retries as usize);
    tokio::spawn(record_retry_logs(db.clone(), retry_log_rx));

    let mut balancer = build_balancer(&meta.strategy, &meta.weights, None);

    // 流式请求缩短响应头超时，上游卡住时快速换道，长响应体不受影响
    let mut header_timeout = Duration::from_secs(meta.time_out.max(1) as u64);
    if before.stream {
        header_timeout /= 3;
    }
    let deadline = Instant::now() + Duration::from_secs(meta.time_out.max(1) as u64);

    let mut cooldown_skipped = 0usize;
    let mut retry = 0;
    while retry < retries {
        if Instant::now() >= deadline {
            return Err(ProxyError::business("retry time out"));
        }

        let id = balancer.pop()?;

        let Some(assoc) = meta.associations.get(&id) else {
            // 数据不一致，移除该候选避免下次重复命中
            balancer.delete(id);
            continue;
        };
        if cooldown_manager.in_cooldown(assoc) {
            cooldown_skipped += 1;
            balancer.reduce(id);
            if cooldown_skipped >= active_providers {
                return Err(ProxyError::business("all providers are in cooldown"));
            }
            continue;
        }
        cooldown_skipped = 0;
        retry += 1;

        let Some(provider) = meta.providers.get(&assoc.provider_id) else {
            balancer.delete(id);
            continue;
        };
        let provider_config = ProviderConfig::parse(&provider.config)?;

        linfo!(
            "dispatch",
            LogStage::UpstreamRequest,
            LogComponent::Dispatcher,
            "using_provider",
            "selected upstream provider",
            provider = %provider.name,
            model = %assoc.provider_model,
            retry = retry
        );

        let mut log = ChatLogRow {
            name: before.model.clone(),
            provider_model: Some(assoc.provider_model.clone()),
            provider_name: Some(provider.name.clone()),
            status: "success".to_string(),
            style: style.to_string(),
            user_agent: req_meta.user_agent.clone(),
            remote_ip: req_meta.remote_ip.clone(),
            auth_key_id,
            chat_io: meta.io_log,
            retry,
            proxy_time_ms: start.elapsed().as_millis() as i64,
            ..ChatLogRow::default()
        };

        let mut headers = build_headers(
            &req_meta.header,
            assoc.with_header,
            &assoc.customer_headers_map(),
            before.stream,
        );

        // 从密钥池取 key，取不到不致命，走渠道默认凭证
        let mut key_id = 0;
        match pool.pick(provider.id).await {
            Ok((key, picked_id)) => {
                key_id = picked_id;
                log.provider_key_id = picked_id;
                let header_value = if style == consts::STYLE_ANTHROPIC {
                    ("x-api-key", key)
                } else {
                    ("authorization", format!("Bearer {key}"))
                };
                if let Ok(value) = header_value.1.parse() {
                    headers.insert(header_value.0, value);
                }
            }
            Err(err) => {
                lwarn!(
                    "dispatch",
                    LogStage::Scheduling,
                    LogComponent::KeyPool,
                    "pick_failed",
                    "key pool pick failed",
                    provider = %provider.name,
                    error = %err
                );
            }
        }

        let request = match build_chat_request(
            style,
            &provider_config,
            headers,
            &assoc.provider_model,
            &before.raw,
        ) {
            Ok(request) => request,
            Err(err) => {
                let _ = retry_log.try_send(log.with_error(&err.to_string()));
                balancer.delete(id);
                apply_error_feedback(&cooldown_manager, &pool, assoc, key_id, Category::Provider)
                    .await;
                continue;
            }
        };

        let response = match tokio::time::timeout(header_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let _ = retry_log.try_send(log.with_error(&err.to_string()));
                balancer.delete(id);
                apply_error_feedback(&cooldown_manager, &pool, assoc, key_id, Category::Provider)
                    .await;
                continue;
            }
            Err(_) => {
                let _ = retry_log.try_send(log.with_error("upstream response header timeout"));
                balancer.delete(id);
                apply_error_feedback(&cooldown_manager, &pool, assoc, key_id, Category::Provider)
                    .await;
                continue;
            }
        };

        let status = response.status().as_u16();
        if status != 200 {
            // 读掉正文便于连接复用，正文进入失败日志
            let body = response.text().await.unwrap_or_default();
            let _ = retry_log.try_send(log.with_error(&format!("status: {status}, body: {body}")));

            let category = cooldown::classify_status(status);
            apply_error_feedback(&cooldown_manager, &pool, assoc, key_id, category).await;
            if category == Category::Key {
                // 命中限流，降权但保留候选
                balancer.reduce(id);
            } else {
                balancer.delete(id);
            }
            continue;
        }

        let log_id = save_chat_log(db, log).await?;

        return Ok((
            response,
            log_id,
            StreamContext {
                assoc: assoc.clone(),
                cooldown: cooldown_manager,
                key_pool: pool,
                key_id,
            },
        ));
    }

    Err(ProxyError::business("maximum retry attempts reached"))
}

/// 对一次失败同时回写关联冷却与密钥冷却，失败仅记日志
async fn apply_error_feedback(
    cooldown_manager: &cooldown::Manager,
    pool: &key_pool::Pool,
    assoc: &model_with_providers::Model,
    key_id: i32,
    category: Category,
) {
    if let Err(err) = cooldown_manager.on_error(assoc, category).await {
        lwarn!(
            "dispatch",
            LogStage::Db,
            LogComponent::Cooldown,
            "on_error_failed",
            "update cooldown error",
            error = %err
        );
    }
    if key_id > 0
        && let Err(err) = pool.on_error(key_id, category).await
    {
        lwarn!(
            "dispatch",
            LogStage::Db,
            LogComponent::KeyPool,
            "on_error_failed",
            "key pool on error",
            error = %err
        );
    }
}

/// 构建上游请求头。按关联配置决定是否透传客户端头，
/// 凭证头一律剥离后由密钥池或渠道默认凭证重新注入
pub fn build_headers(
    source: &HeaderMap,
    with_header: bool,
    customer_headers: &HashMap<String, String>,
    stream: bool,
) -> HeaderMap {
    let mut headers = if with_header {
        source.clone()
    } else {
        HeaderMap::new()
    };

    if stream {
        headers.insert("x-accel-buffering", "no".parse().expect("static header"));
    }

    headers.remove(AUTHORIZATION);
    headers.remove("x-api-key");
    // 宿主相关头不应透传到上游
    headers.remove("host");
    headers.remove("content-length");

    for (name, value) in customer_headers {
        let Ok(header_name) = name.parse::<axum::http::HeaderName>() else {
            continue;
        };
        let Ok(header_value) = value.parse() else {
            continue;
        };
        headers.insert(header_name, header_value);
    }

    ldebug!(
        "dispatch",
        LogStage::UpstreamRequest,
        LogComponent::Dispatcher,
        "build_headers",
        "built upstream headers",
        count = headers.len()
    );

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_headers_strips_credentials() {
        let mut source = HeaderMap::new();
        source.insert(AUTHORIZATION, "Bearer client-secret".parse().unwrap());
        source.insert("x-api-key", "client-key".parse().unwrap());
        source.insert("user-agent", "test-agent".parse().unwrap());

        let headers = build_headers(&source, true, &HashMap::new(), false);
        assert!(!headers.contains_key(AUTHORIZATION));
        assert!(!headers.contains_key("x-api-key"));
        assert_eq!(headers["user-agent"], "test-agent");
    }

    #[test]
    fn build_headers_without_passthrough_starts_empty() {
        let mut source = HeaderMap::new();
        source.insert("user-agent", "test-agent".parse().unwrap());
        let headers = build_headers(&source, false, &HashMap::new(), false);
        assert!(!headers.contains_key("user-agent"));
    }

    #[test]
    fn build_headers_overlays_customer_headers_and_sse_hint() {
        let customer = HashMap::from([("x-tenant".to_string(), "acme".to_string())]);
        let headers = build_headers(&HeaderMap::new(), false, &customer, true);
        assert_eq!(headers["x-tenant"], "acme");
        assert_eq!(headers["x-accel-buffering"], "no");
    }
}
