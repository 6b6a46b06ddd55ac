use axum::{
    extract::{Multipart, Path, Query, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::error::{ImportError, LaunchError, LrsError};
use crate::importer::{ImportOutcome, PackageImporter};
use crate::launch::{AuthGrant, LaunchDescriptor, LaunchManager, LaunchOptions};
use crate::lrs::{Lrs, StatementQuery};
use crate::models::*;
use crate::moveon::{load_progress, Progress};
use crate::packages::PackageRepo;
use crate::validate::{validate_cmi5, validate_statement, Violation};
use crate::xapi::{Actor, Statement, StatementResultPage, CMI5_CATEGORY};

type ApiError = (StatusCode, String);

const DEFAULT_STATEMENT_LIMIT: u32 = 100;
const MAX_STATEMENT_LIMIT: u32 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub packages: PackageRepo,
    pub importer: PackageImporter,
    pub launcher: LaunchManager,
    pub lrs: Arc<dyn Lrs>,
}

pub fn router(state: AppState, content_dir: impl Into<PathBuf>) -> Router {
    // xAPI resources, open only to holders of a token from /fetch
    let xapi = Router::new()
        .route("/xapi/statements", put(put_statement).post(post_statements).get(get_statements))
        .route("/xapi/activities/state", put(put_state).get(get_state).delete(delete_state))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        // packages
        .route("/api/packages", get(list_packages))
        .route("/api/packages/upload", post(upload_package))
        .route("/api/packages/:id", get(get_package).delete(delete_package))
        .route("/api/packages/:id/course", put(assign_course))
        .route("/api/packages/:id/activities", get(list_activities))
        // launch + progress
        .route("/api/launch", post(launch))
        .route("/api/progress", get(progress))
        .route("/fetch/:token", post(fetch))
        .merge(xapi)
        // extracted package content
        .nest_service("/content", ServeDir::new(content_dir.into()))
        .with_state(state)
}

async fn upload_package(
    State(st): State<AppState>,
    mut mp: Multipart,
) -> Result<(StatusCode, Json<ImportOutcome>), ApiError> {
    let mut archive: Option<Vec<u8>> = None;
    let mut course_id = None;
    let mut uploaded_by = None;

    while let Some(field) = mp.next_field().await.map_err(|e| e400(e.to_string()))? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => archive = Some(field.bytes().await.map_err(|e| e400(e.to_string()))?.to_vec()),
            "course_id" => course_id = Some(parse_uuid(&field.text().await.map_err(e500)?)?),
            "uploaded_by" => uploaded_by = Some(parse_uuid(&field.text().await.map_err(e500)?)?),
            _ => {}
        }
    }

    let archive = archive.ok_or_else(|| e400("file is required"))?;
    let uploaded_by = uploaded_by.ok_or_else(|| e400("uploaded_by is required"))?;
    let outcome = st
        .importer
        .import_package(archive, course_id, uploaded_by)
        .await
        .map_err(import_error)?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn list_packages(State(st): State<AppState>) -> Result<Json<Vec<Package>>, ApiError> {
    Ok(Json(st.packages.list().await.map_err(e500)?))
}

async fn get_package(State(st): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Package>, ApiError> {
    st.packages
        .get(id)
        .await
        .map_err(e500)?
        .map(Json)
        .ok_or_else(|| e404(format!("package {id} not found")))
}

async fn delete_package(State(st): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    st.importer.delete_package(id).await.map_err(import_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn assign_course(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignCourseReq>,
) -> Result<StatusCode, ApiError> {
    st.importer
        .assign_package_to_course(id, req.course_id)
        .await
        .map_err(import_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_activities(State(st): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Vec<Activity>>, ApiError> {
    Ok(Json(st.importer.get_activities(id).await.map_err(import_error)?))
}

async fn launch(State(st): State<AppState>, Json(req): Json<LaunchReq>) -> Result<Json<LaunchDescriptor>, ApiError> {
    let opts = LaunchOptions { session_id: req.session_id, registration: req.registration };
    let descriptor = st
        .launcher
        .launch(req.package_id, &req.activity_id, &req.learner_id, opts)
        .await
        .map_err(launch_error)?;
    Ok(Json(descriptor))
}

async fn fetch(State(st): State<AppState>, Path(token): Path<String>) -> Result<Json<Value>, ApiError> {
    let auth = st.launcher.tokens().redeem(&token).map_err(launch_error)?;
    Ok(Json(json!({ "auth-token": auth })))
}

#[derive(Serialize)]
struct ProgressReport {
    progress: Progress,
    move_on: MoveOn,
    satisfied: bool,
}

async fn progress(State(st): State<AppState>, Query(q): Query<ProgressQuery>) -> Result<Json<ProgressReport>, ApiError> {
    let activity = st
        .packages
        .activity(q.package_id, &q.activity_id)
        .await
        .map_err(e500)?
        .ok_or_else(|| e404(format!("activity '{}' not found", q.activity_id)))?;
    let progress = load_progress(st.lrs.as_ref(), &activity, &q.learner_id, q.registration)
        .await
        .map_err(lrs_error)?;
    Ok(Json(ProgressReport {
        satisfied: progress.satisfies(activity.move_on),
        move_on: activity.move_on,
        progress,
    }))
}

// --- xAPI ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementIdQuery {
    statement_id: Uuid,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StatementBatch {
    One(Statement),
    Many(Vec<Statement>),
}

#[derive(Deserialize)]
struct StatementsQuery {
    activity: Option<String>,
    agent: Option<String>,
    registration: Option<Uuid>,
    verb: Option<String>,
    /// 0 asks for the server maximum.
    limit: Option<u32>,
    #[serde(default)]
    ascending: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateQuery {
    activity_id: String,
    agent: String,
    state_id: String,
}

async fn put_statement(
    State(st): State<AppState>,
    Extension(grant): Extension<AuthGrant>,
    Query(q): Query<StatementIdQuery>,
    Json(mut stmt): Json<Value>,
) -> Result<StatusCode, ApiError> {
    // a body without an id takes the one from the query
    if let Some(obj) = stmt.as_object_mut() {
        let conflicting = obj
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
            .is_some_and(|id| id != q.statement_id);
        if conflicting {
            return Err(e400("statementId does not match statement id"));
        }
        obj.insert("id".into(), json!(q.statement_id));
    }
    let stmt: Statement = serde_json::from_value(stmt).map_err(|e| e400(e.to_string()))?;
    ensure_learner(&grant, stmt.actor_name().unwrap_or(""))?;
    store_statement(&st, &stmt).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_statements(
    State(st): State<AppState>,
    Extension(grant): Extension<AuthGrant>,
    Json(batch): Json<StatementBatch>,
) -> Result<Json<Vec<Uuid>>, ApiError> {
    let batch = match batch {
        StatementBatch::One(s) => vec![s],
        StatementBatch::Many(v) => v,
    };
    // reject the whole batch before storing any of it
    for s in &batch {
        ensure_learner(&grant, s.actor_name().unwrap_or(""))?;
        check_statement(s)?;
    }
    let mut ids = Vec::with_capacity(batch.len());
    for s in &batch {
        ids.push(st.lrs.send_statement(s).await.map_err(lrs_error)?);
    }
    Ok(Json(ids))
}

async fn get_statements(
    State(st): State<AppState>,
    Extension(grant): Extension<AuthGrant>,
    Query(q): Query<StatementsQuery>,
) -> Result<Json<StatementResultPage>, ApiError> {
    let user = match q.agent.as_deref() {
        Some(raw) => agent_name(raw)?,
        None => grant.learner_id.clone(),
    };
    ensure_learner(&grant, &user)?;
    let limit = match q.limit {
        None => DEFAULT_STATEMENT_LIMIT,
        Some(0) => MAX_STATEMENT_LIMIT,
        Some(n) => n.min(MAX_STATEMENT_LIMIT),
    };
    let query = StatementQuery {
        activity_id: q.activity,
        user_id: Some(user),
        registration: q.registration,
        verbs: q.verb.into_iter().collect(),
        limit: Some(limit),
    };
    let mut statements = st.lrs.query_statements(&query).await.map_err(lrs_error)?;
    // xAPI default order is newest first
    if !q.ascending {
        statements.reverse();
    }
    Ok(Json(StatementResultPage { statements, more: String::new() }))
}

async fn put_state(
    State(st): State<AppState>,
    Extension(grant): Extension<AuthGrant>,
    Query(q): Query<StateQuery>,
    Json(value): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let user = agent_name(&q.agent)?;
    ensure_learner(&grant, &user)?;
    st.lrs
        .set_state(&q.activity_id, &user, &q.state_id, &value)
        .await
        .map_err(lrs_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_state(
    State(st): State<AppState>,
    Extension(grant): Extension<AuthGrant>,
    Query(q): Query<StateQuery>,
) -> Result<Json<Value>, ApiError> {
    let user = agent_name(&q.agent)?;
    ensure_learner(&grant, &user)?;
    st.lrs
        .get_state(&q.activity_id, &user, &q.state_id)
        .await
        .map_err(lrs_error)?
        .map(Json)
        .ok_or_else(|| e404("state not found"))
}

async fn delete_state(
    State(st): State<AppState>,
    Extension(grant): Extension<AuthGrant>,
    Query(q): Query<StateQuery>,
) -> Result<StatusCode, ApiError> {
    let user = agent_name(&q.agent)?;
    ensure_learner(&grant, &user)?;
    st.lrs
        .delete_state(&q.activity_id, &user, &q.state_id)
        .await
        .map_err(lrs_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn store_statement(st: &AppState, stmt: &Statement) -> Result<(), ApiError> {
    check_statement(stmt)?;
    st.lrs.send_statement(stmt).await.map_err(lrs_error)?;
    Ok(())
}

/// cmi5 rules apply to statements that declare the cmi5 category.
fn check_statement(stmt: &Statement) -> Result<(), ApiError> {
    let cmi5 = stmt
        .context
        .as_ref()
        .and_then(|c| c.context_activities.as_ref())
        .and_then(|ca| ca.category.as_ref())
        .is_some_and(|cats| cats.iter().any(|c| c.id == CMI5_CATEGORY));
    let violations = if cmi5 { validate_cmi5(stmt) } else { validate_statement(stmt) };
    if violations.is_empty() {
        return Ok(());
    }
    Err(e400(violations.iter().map(Violation::to_string).collect::<Vec<_>>().join("; ")))
}

/// Resolve `Authorization: Basic <token>` against tokens issued by `/fetch`
/// and hand the grant to the handler.
async fn require_auth(State(st): State<AppState>, mut request: Request, next: Next) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .map(str::trim)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing Basic authorization".to_string()))?;
    let grant = st.launcher.tokens().authorize(token).map_err(launch_error)?;
    request.extensions_mut().insert(grant);
    Ok(next.run(request).await)
}

/// A token only covers the learner it was launched for.
fn ensure_learner(grant: &AuthGrant, user: &str) -> Result<(), ApiError> {
    if user == grant.learner_id {
        return Ok(());
    }
    tracing::warn!(session = %grant.session_id, requested = user, "xapi request outside its learner");
    Err((StatusCode::FORBIDDEN, format!("token does not cover learner '{user}'")))
}

/// Learner id from an xAPI `agent` parameter (JSON with an account).
fn agent_name(raw: &str) -> Result<String, ApiError> {
    let actor: Actor = serde_json::from_str(raw).map_err(|e| e400(format!("invalid agent: {e}")))?;
    actor
        .account
        .map(|a| a.name)
        .ok_or_else(|| e400("agent must identify an account"))
}

// --- helpers ---
fn e400<T: Into<String>>(msg: T) -> ApiError {
    (StatusCode::BAD_REQUEST, msg.into())
}

fn e404<T: Into<String>>(msg: T) -> ApiError {
    (StatusCode::NOT_FOUND, msg.into())
}

fn e500<E: std::fmt::Display>(e: E) -> ApiError {
    tracing::error!(error=%e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn parse_uuid(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| e400(format!("'{raw}' is not a uuid")))
}

fn import_error(e: ImportError) -> ApiError {
    match e {
        ImportError::NotFound(_) => e404(e.to_string()),
        ImportError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
        ImportError::UnsupportedFormat | ImportError::ManifestNotFound | ImportError::InvalidManifest(_) => {
            e400(e.to_string())
        }
        ImportError::Storage(_) | ImportError::Database(_) => e500(e),
    }
}

fn launch_error(e: LaunchError) -> ApiError {
    match e {
        LaunchError::PackageNotFound(_) | LaunchError::ActivityNotFound { .. } => e404(e.to_string()),
        LaunchError::UnknownToken | LaunchError::TokenExpired => (StatusCode::UNAUTHORIZED, e.to_string()),
        LaunchError::Lrs(inner) => lrs_error(inner),
        LaunchError::Database(_) => e500(e),
    }
}

fn lrs_error(e: LrsError) -> ApiError {
    match e {
        LrsError::Rejected { status, body } => {
            (StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY), body)
        }
        LrsError::Transport(_) => {
            tracing::warn!(error = %e, "lrs unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        LrsError::Storage(_) | LrsError::Decode(_) => e500(e),
    }
}
