//! # 接入认证模块
//!
//! 解析 Bearer 令牌并在请求扩展里放入租户上下文。
//! 管理员令牌解析为零租户，零租户天然不参与响应缓存

use crate::consts;
use crate::handler::AppState;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};
use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use entity::auth_keys::{self, Entity as AuthKeys};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde_json::json;

/// 每请求的租户上下文
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub auth_key_id: i32,
    pub allow_all: bool,
    pub allow_models: Vec<String>,
}

impl AuthContext {
    /// 零租户管理身份
    #[must_use]
    pub const fn admin() -> Self {
        Self {
            auth_key_id: 0,
            allow_all: true,
            allow_models: Vec::new(),
        }
    }

    /// 是否有权使用指定模型
    #[must_use]
    pub fn allows_model(&self, model: &str) -> bool {
        self.allow_all || self.allow_models.iter().any(|allowed| allowed == model)
    }
}

/// 认证中间件：校验令牌、装配上下文、异步记一次使用
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return unauthorized();
    };

    if !state.config.auth.admin_token.is_empty() && token == state.config.auth.admin_token {
        request.extensions_mut().insert(AuthContext::admin());
        return next.run(request).await;
    }

    let Some(tail) = token.strip_prefix(consts::AUTH_KEY_PREFIX) else {
        return unauthorized();
    };
    if tail.len() != consts::AUTH_KEY_LENGTH {
        return unauthorized();
    }

    let found = AuthKeys::find()
        .filter(auth_keys::Column::Key.eq(&token))
        .filter(auth_keys::Column::Status.eq(true))
        .filter(auth_keys::Column::DeletedAt.is_null())
        .one(&state.db)
        .await;

    let key = match found {
        Ok(Some(key)) => key,
        Ok(None) => return unauthorized(),
        Err(err) => {
            lwarn!(
                "auth",
                LogStage::Authentication,
                LogComponent::Auth,
                "lookup_failed",
                "auth key lookup error",
                error = %err
            );
            return unauthorized();
        }
    };

    if key
        .expires_at
        .is_some_and(|expires_at| Utc::now().naive_utc() >= expires_at)
    {
        return unauthorized();
    }

    ldebug!(
        "auth",
        LogStage::Authentication,
        LogComponent::Auth,
        "authenticated",
        "auth key accepted",
        auth_key_id = key.id,
        allow_all = key.allow_all
    );

    touch_usage(state.db.clone(), key.id);

    request.extensions_mut().insert(AuthContext {
        auth_key_id: key.id,
        allow_all: key.allow_all,
        allow_models: key.allowed_models(),
    });
    next.run(request).await
}

/// 异步累计使用次数与最后使用时间，失败不影响请求
fn touch_usage(db: DatabaseConnection, key_id: i32) {
    tokio::spawn(async move {
        let result = AuthKeys::update_many()
            .col_expr(
                auth_keys::Column::UsageCount,
                Expr::col(auth_keys::Column::UsageCount).add(1),
            )
            .col_expr(
                auth_keys::Column::LastUsedAt,
                Expr::value(Utc::now().naive_utc()),
            )
            .filter(auth_keys::Column::Id.eq(key_id))
            .exec(&db)
            .await;
        if let Err(err) = result {
            lwarn!(
                "auth",
                LogStage::Db,
                LogComponent::Auth,
                "touch_usage_failed",
                "bump auth key usage error",
                error = %err
            );
        }
    });
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid auth key" })),
    )
        .into_response()
}
