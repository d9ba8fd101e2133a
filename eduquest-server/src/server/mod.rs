mod acl;
pub mod auth;
mod config;

use crate::server::auth::AuthCtx;
use crate::storage::{ListPages, NewTaskInput, StorageError, TaskPage, TaskWithPoints};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::response::Response as AxumResponse;
use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{Method, StatusCode, header},
    routing::{delete, get, post},
};
use chrono::{NaiveDate, NaiveDateTime, Utc};
pub use config::{AppConfig, ConfigError, UserConfig};
use eduquest_shared::api;
use eduquest_shared::auth::Role;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Span, info_span};
use uuid::Uuid;

/// Fixed page size for each task-listing bucket.
const TASK_PAGE_SIZE: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: crate::storage::Store,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, store: crate::storage::Store) -> Self {
        Self {
            config,
            store,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Calendar date in the family's configured timezone. Due-date checks
    /// and the overdue sweep are anchored to this, not to UTC.
    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.config.timezone()).date_naive()
    }

    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

#[derive(Clone, Debug)]
struct ReqId(pub String);

pub fn router(state: AppState) -> Router {
    let private = Router::new()
        .route("/api/children", get(api_list_children))
        .route(
            "/api/children/{id}/preferences",
            get(api_list_preferences).put(api_set_preferences),
        )
        .route("/api/children/{id}/overview", get(api_child_overview))
        .route("/api/children/{id}/reward", get(api_active_reward))
        .route("/api/children/{id}/rewards", post(api_create_reward))
        .route(
            "/api/children/{id}/rewards/{reward_id}",
            post(api_update_reward).delete(api_delete_reward),
        )
        .route(
            "/api/children/{id}/rewards/{reward_id}/claim",
            post(api_claim_reward),
        )
        .route("/api/tasks", get(api_list_tasks).post(api_create_task))
        .route("/api/tasks/{id}", get(api_task_detail).delete(api_delete_task))
        .route("/api/tasks/{id}/start", post(api_start_task))
        .route("/api/tasks/{id}/pause", post(api_pause_task))
        .route("/api/tasks/{id}/finish", post(api_finish_task))
        .route("/api/tasks/{id}/finish-early", post(api_finish_early_task))
        .route("/api/parents/{id}", delete(api_delete_parent))
        .with_state(state.clone())
        .layer(middleware::from_fn(acl::enforce_acl))
        .layer(middleware::from_fn(set_auth_span_fields))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    // Trace with request context (method, path, request_id)
    let trace = TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
        let request_id = req
            .extensions()
            .get::<ReqId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
            username = tracing::field::Empty,
            role = tracing::field::Empty,
        )
    });

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/api/auth/login", post(api_auth_login))
        .merge(private)
        .with_state(state.clone())
        .layer(trace)
        .layer(middleware::from_fn(add_security_headers))
        .layer(middleware::from_fn(add_request_id));

    // Optionally add CORS for dev if configured

    if let Some(origin) = &state.config.dev_cors_origin {
        let hv = header::HeaderValue::from_str(origin)
            .unwrap_or(header::HeaderValue::from_static("http://localhost:5173"));
        let cors = CorsLayer::new()
            .allow_origin(hv)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
        app.layer(cors)
    } else {
        app
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn add_request_id(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let hdr = HeaderName::from_static("x-request-id");
    // Use provided x-request-id if present, else generate
    let rid = req
        .headers()
        .get(&hdr)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    // Put into request extensions for trace layer & handlers
    req.extensions_mut().insert(ReqId(rid.clone()));
    let mut resp = next.run(req).await;
    // Set header on response
    if let Ok(hv) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(hdr, hv);
    }
    Ok(resp)
}

async fn add_security_headers(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let path = req.uri().path().to_string();
    let mut resp = next.run(req).await;

    let headers = resp.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("SAMEORIGIN"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );

    // Disable caching for API and health endpoints
    if path == "/healthz" || path.starts_with("/api/") || path == "/api" {
        headers.insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
        );
        headers.insert(
            HeaderName::from_static("pragma"),
            HeaderValue::from_static("no-cache"),
        );
    }

    Ok(resp)
}

async fn set_auth_span_fields(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    if let Some(auth) = req.extensions().get::<AuthCtx>() {
        let span = Span::current();
        span.record("username", tracing::field::display(&auth.claims.sub));
        span.record("role", tracing::field::debug(&auth.claims.role));
    }
    Ok(next.run(req).await)
}

async fn api_auth_login(
    State(state): State<AppState>,
    Json(body): Json<api::AuthReq>,
) -> Result<Json<api::AuthResp>, AppError> {
    let user = state.config.user(&body.username).ok_or_else(|| {
        tracing::warn!(username=%body.username, "login: unknown username");
        AppError::unauthorized()
    })?;
    if !auth::verify_credentials(&state, &body.username, &body.password) {
        return Err(AppError::unauthorized());
    }
    let parent_id = match user.role {
        Role::Parent => None,
        Role::Child => state.config.parent_of(&user.username).map(str::to_string),
    };
    let token = auth::issue_jwt_for_user(&state, &user.username, user.role, parent_id)?;
    Ok(Json(api::AuthResp { token }))
}

async fn api_list_children(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<Vec<api::ChildDto>>, AppError> {
    let rows = state
        .store
        .list_children_of_parent(&auth.claims.sub)
        .await
        .map_err(AppError::from_storage)?;
    let items = rows
        .into_iter()
        .map(|(c, has_preferences)| api::ChildDto {
            id: c.id,
            display_name: c.display_name,
            has_preferences,
        })
        .collect();
    Ok(Json(items))
}

#[derive(Deserialize)]
struct ChildPathId {
    id: String,
}

#[derive(Deserialize)]
struct ChildRewardPath {
    id: String,
    reward_id: i32,
}

#[derive(Deserialize)]
struct TaskPathId {
    id: i32,
}

async fn api_list_preferences(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ChildPathId>,
) -> Result<Json<Vec<api::PreferenceWithSubjectDto>>, AppError> {
    state
        .store
        .get_child_of_parent(&auth.claims.sub, &p.id)
        .await
        .map_err(AppError::from_storage)?;
    let rows = state
        .store
        .list_preferences(&p.id)
        .await
        .map_err(AppError::from_storage)?;
    let items = rows
        .into_iter()
        .map(|(pref, subject_name)| api::PreferenceWithSubjectDto {
            subject_id: pref.subject_id,
            subject_name,
            difficulty: pref.difficulty,
        })
        .collect();
    Ok(Json(items))
}

async fn api_set_preferences(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ChildPathId>,
    Json(body): Json<api::SetPreferencesReq>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .get_child_of_parent(&auth.claims.sub, &p.id)
        .await
        .map_err(AppError::from_storage)?;

    let mut seen = std::collections::HashSet::new();
    for pref in &body.preferences {
        if !state.config.subjects.iter().any(|s| s.id == pref.subject_id) {
            return Err(AppError::bad_request(format!(
                "unknown subject: {}",
                pref.subject_id
            )));
        }
        if !seen.insert(pref.subject_id.clone()) {
            return Err(AppError::bad_request(format!(
                "duplicate subject: {}",
                pref.subject_id
            )));
        }
    }

    let prefs: Vec<(String, i32)> = body
        .preferences
        .iter()
        .map(|pref| (pref.subject_id.clone(), pref.difficulty))
        .collect();
    state
        .store
        .replace_preferences(&p.id, &prefs)
        .await
        .map_err(AppError::from_storage)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_child_overview(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ChildPathId>,
) -> Result<Json<api::ChildOverviewDto>, AppError> {
    let child = state
        .store
        .get_child_of_parent(&auth.claims.sub, &p.id)
        .await
        .map_err(AppError::from_storage)?;
    let prefs = state
        .store
        .list_preferences(&p.id)
        .await
        .map_err(AppError::from_storage)?;
    let tasks = state
        .store
        .list_tasks_for_overview(&p.id, state.today())
        .await
        .map_err(AppError::from_storage)?;
    let reward = reward_progress_dto(&state, &p.id).await?;

    Ok(Json(api::ChildOverviewDto {
        child: api::ChildDto {
            id: child.id,
            display_name: child.display_name,
            has_preferences: !prefs.is_empty(),
        },
        preferences: prefs
            .into_iter()
            .map(|(pref, subject_name)| api::PreferenceWithSubjectDto {
                subject_id: pref.subject_id,
                subject_name,
                difficulty: pref.difficulty,
            })
            .collect(),
        tasks: tasks.iter().map(task_dto).collect(),
        reward,
    }))
}

#[derive(Deserialize)]
struct TaskListQuery {
    started_page: Option<usize>,
    todo_page: Option<usize>,
    done_page: Option<usize>,
    overdue_page: Option<usize>,
}

async fn api_list_tasks(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Query(q): Query<TaskListQuery>,
) -> Result<Json<api::TaskListDto>, AppError> {
    let pages = ListPages {
        started: q.started_page.unwrap_or(1),
        todo: q.todo_page.unwrap_or(1),
        done: q.done_page.unwrap_or(1),
        overdue: q.overdue_page.unwrap_or(1),
    };
    let buckets = state
        .store
        .sweep_and_list_tasks(&auth.claims.sub, state.today(), pages, TASK_PAGE_SIZE)
        .await
        .map_err(AppError::from_storage)?;
    Ok(Json(api::TaskListDto {
        started: page_dto(buckets.started),
        todo: page_dto(buckets.todo),
        done: page_dto(buckets.done),
        overdue: page_dto(buckets.overdue),
    }))
}

async fn api_create_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<api::TaskCreateReq>,
) -> Result<Json<api::TaskDto>, AppError> {
    if body.title.trim().is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }
    let input = NewTaskInput {
        subject_id: body.subject_id,
        title: body.title,
        description: body.description,
        due_date: body.due_date,
        time_minutes: body.time_minutes,
    };
    let task = state
        .store
        .create_task(&auth.claims.sub, input, state.today(), state.now())
        .await
        .map_err(AppError::from_storage)?;
    let detail = state
        .store
        .get_task_with_points(&auth.claims.sub, task.id, state.today())
        .await
        .map_err(AppError::from_storage)?;
    Ok(Json(task_dto(&detail)))
}

async fn api_task_detail(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<TaskPathId>,
) -> Result<Json<api::TaskDto>, AppError> {
    let detail = state
        .store
        .get_task_with_points(&auth.claims.sub, p.id, state.today())
        .await
        .map_err(AppError::from_storage)?;
    Ok(Json(task_dto(&detail)))
}

async fn api_delete_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<TaskPathId>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .delete_task(&auth.claims.sub, p.id)
        .await
        .map_err(AppError::from_storage)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_start_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<TaskPathId>,
) -> Result<Json<api::StartTaskResp>, AppError> {
    let minutes = state
        .store
        .start_task(&auth.claims.sub, p.id, state.now())
        .await
        .map_err(AppError::from_storage)?;
    Ok(Json(api::StartTaskResp { minutes }))
}

async fn api_pause_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<TaskPathId>,
    Json(body): Json<api::PauseTaskReq>,
) -> Result<StatusCode, AppError> {
    if body.remaining_minutes < 0 {
        return Err(AppError::bad_request(
            "remaining_minutes must be non-negative",
        ));
    }
    state
        .store
        .pause_task(&auth.claims.sub, p.id, body.remaining_minutes)
        .await
        .map_err(AppError::from_storage)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_finish_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<TaskPathId>,
) -> Result<Json<api::FinishTaskResp>, AppError> {
    let awarded = state
        .store
        .finish_task(&auth.claims.sub, p.id, state.now())
        .await
        .map_err(AppError::from_storage)?;
    Ok(Json(api::FinishTaskResp { awarded }))
}

/// Same effect as finish, but gated on the owning child's parent typing
/// their password. A failed credential check rejects the transition before
/// any state is touched.
async fn api_finish_early_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<TaskPathId>,
    Json(body): Json<api::FinishEarlyReq>,
) -> Result<Json<api::FinishTaskResp>, AppError> {
    let parent = auth
        .claims
        .parent_id
        .as_deref()
        .ok_or_else(AppError::forbidden)?;
    if !auth::verify_credentials(&state, parent, &body.password) {
        return Err(AppError::forbidden());
    }
    let awarded = state
        .store
        .finish_task(&auth.claims.sub, p.id, state.now())
        .await
        .map_err(AppError::from_storage)?;
    Ok(Json(api::FinishTaskResp { awarded }))
}

async fn api_create_reward(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ChildPathId>,
    Json(body): Json<api::RewardCreateReq>,
) -> Result<Json<api::RewardDto>, AppError> {
    state
        .store
        .get_child_of_parent(&auth.claims.sub, &p.id)
        .await
        .map_err(AppError::from_storage)?;
    let reward = state
        .store
        .create_reward(&p.id, &body.name, body.points_required, state.now())
        .await
        .map_err(AppError::from_storage)?;
    Ok(Json(reward_dto(&reward)))
}

async fn api_update_reward(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ChildRewardPath>,
    Json(body): Json<api::RewardUpdateReq>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .get_child_of_parent(&auth.claims.sub, &p.id)
        .await
        .map_err(AppError::from_storage)?;
    state
        .store
        .update_reward(&p.id, p.reward_id, &body.name, body.points_required)
        .await
        .map_err(AppError::from_storage)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_delete_reward(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ChildRewardPath>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .get_child_of_parent(&auth.claims.sub, &p.id)
        .await
        .map_err(AppError::from_storage)?;
    state
        .store
        .delete_reward(&p.id, p.reward_id)
        .await
        .map_err(AppError::from_storage)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_claim_reward(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ChildRewardPath>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .get_child_of_parent(&auth.claims.sub, &p.id)
        .await
        .map_err(AppError::from_storage)?;
    state
        .store
        .claim_reward(&p.id, p.reward_id)
        .await
        .map_err(AppError::from_storage)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_active_reward(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ChildPathId>,
) -> Result<Json<api::RewardProgressDto>, AppError> {
    // Children reach this route only for themselves (ACL); parents must own
    // the child.
    if auth.claims.role == Role::Parent {
        state
            .store
            .get_child_of_parent(&auth.claims.sub, &p.id)
            .await
            .map_err(AppError::from_storage)?;
    }
    let progress = reward_progress_dto(&state, &p.id).await?;
    Ok(Json(progress))
}

async fn api_delete_parent(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ChildPathId>,
    Json(body): Json<api::DeleteParentReq>,
) -> Result<StatusCode, AppError> {
    // ACL already pinned the path id to the token subject; re-authenticate
    // before wiping the whole family.
    if !auth::verify_credentials(&state, &auth.claims.sub, &body.password) {
        return Err(AppError::forbidden());
    }
    state
        .store
        .delete_parent_cascade(&p.id)
        .await
        .map_err(AppError::from_storage)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reward_progress_dto(
    state: &AppState,
    child: &str,
) -> Result<api::RewardProgressDto, AppError> {
    let progress = state
        .store
        .active_reward_progress(child)
        .await
        .map_err(AppError::from_storage)?;
    Ok(match progress {
        Some((reward, earned)) => api::RewardProgressDto {
            achieved: earned >= reward.points_required as i64,
            earned_points: earned,
            reward: Some(reward_dto(&reward)),
        },
        None => api::RewardProgressDto {
            reward: None,
            earned_points: 0,
            achieved: false,
        },
    })
}

fn rfc3339(dt: NaiveDateTime) -> String {
    chrono::DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}

fn task_dto(t: &TaskWithPoints) -> api::TaskDto {
    api::TaskDto {
        id: t.task.id,
        subject_id: t.task.subject_id.clone(),
        subject_name: t.subject_name.clone(),
        title: t.task.title.clone(),
        description: t.task.description.clone(),
        due_date: t.task.due_date,
        time_minutes: t.task.time_minutes,
        status: t.task.status(),
        points: t.points,
        started_at: t.task.started_at.map(rfc3339),
        finished_at: t.task.finished_at.map(rfc3339),
    }
}

fn page_dto(p: TaskPage) -> api::TaskPageDto {
    api::TaskPageDto {
        items: p.items.iter().map(task_dto).collect(),
        page: p.page,
        total: p.total,
    }
}

fn reward_dto(r: &crate::storage::models::Reward) -> api::RewardDto {
    api::RewardDto {
        id: r.id,
        name: r.name.clone(),
        points_required: r.points_required,
        is_active: r.is_active,
        created_at: rfc3339(r.created_at),
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound(String),
    Internal(String),
}

impl AppError {
    fn bad_request<T: Into<String>>(msg: T) -> Self {
        Self::BadRequest(msg.into())
    }
    fn unauthorized() -> Self {
        Self::Unauthorized
    }
    fn forbidden() -> Self {
        Self::Forbidden
    }
    fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Storage errors carry enough shape to pick the right status: invalid
    /// input and invalid transitions are the caller's fault, missing or
    /// foreign records read as not found, the rest is internal.
    fn from_storage(e: StorageError) -> Self {
        match e {
            StorageError::InvalidInput(m) => Self::BadRequest(m),
            StorageError::NotFound(m) => Self::NotFound(m),
            other => Self::internal(other),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, kind, detail) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m, "bad_request", None),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized".into(),
                "unauthorized",
                None,
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".into(), "forbidden", None),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m, "not_found", None),
            // Do not leak internal error details to clients, but log them
            AppError::Internal(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".into(),
                "internal",
                Some(m),
            ),
        };
        if let Some(detail) = detail {
            tracing::error!(status = %status, kind = kind, message = %msg, detail = %detail, "request failed");
        } else {
            tracing::error!(status = %status, kind = kind, message = %msg, "request failed");
        }
        let body = axum::Json(ErrorBody { error: msg });
        (status, body).into_response()
    }
}
