// API route handlers
//
// Task submission, status and listing, plus the service status and metrics
// endpoints. Handlers translate HTTP into core calls and back; policy
// lives in admission and the executor.

use actix_web::{get, post, web, HttpRequest, HttpResponse};
use chrono::DateTime;
use log::warn;

use crate::error::ApiError;
use crate::handlers::{caller_from_request, AppContext};
use crate::models::{
    CreateTaskRequest, ListTasksQuery, ServiceStatusResponse, TaskDetailResponse, TaskListResponse,
};
use crate::store::{QueueStore, TaskStatus, TaskStore, TranscriptStore};

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

/// Admit a transcription task.
#[post("/tasks")]
pub async fn submit_task(
    req: HttpRequest,
    body: web::Json<CreateTaskRequest>,
    ctx: web::Data<AppContext>,
) -> Result<HttpResponse, ApiError> {
    let caller = caller_from_request(&req);
    let response = ctx.admission.create_task(body.into_inner(), &caller).await?;
    Ok(HttpResponse::Accepted().json(response))
}

/// Task state, including the transcript once succeeded.
#[get("/tasks/{id}")]
pub async fn get_task(
    req: HttpRequest,
    id: web::Path<String>,
    ctx: web::Data<AppContext>,
) -> Result<HttpResponse, ApiError> {
    let id = id.into_inner();
    let caller = caller_from_request(&req);

    let task = ctx
        .store
        .get_task(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;

    if !caller.owns(&task) {
        return Err(ApiError::Forbidden("not your task".into()));
    }

    let transcript = if task.status == TaskStatus::Succeeded {
        ctx.store.get_transcript(&id).await?
    } else {
        None
    };

    Ok(HttpResponse::Ok().json(TaskDetailResponse::from_record(task, transcript)))
}

/// Tasks of the calling owner, newest first, cursor-paginated.
#[get("/tasks")]
pub async fn list_tasks(
    req: HttpRequest,
    query: web::Query<ListTasksQuery>,
    ctx: web::Data<AppContext>,
) -> Result<HttpResponse, ApiError> {
    let caller = caller_from_request(&req);
    if caller.user_id.is_none() && caller.anon_id.is_none() {
        return Err(ApiError::Unauthorized("identity required".into()));
    }

    let cursor = match query.cursor.as_deref() {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|_| ApiError::invalid_input("cursor is not a timestamp"))?
                .with_timezone(&chrono::Utc),
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);

    let tasks = ctx
        .store
        .list_tasks(
            caller.user_id.as_deref(),
            caller.anon_id.as_deref(),
            query.status,
            cursor,
            limit,
        )
        .await?;

    let next_cursor = if tasks.len() == limit as usize {
        tasks.last().map(|t| t.created_at.to_rfc3339())
    } else {
        None
    };

    Ok(HttpResponse::Ok().json(TaskListResponse {
        tasks: tasks
            .into_iter()
            .map(|t| TaskDetailResponse::from_record(t, None))
            .collect(),
        next_cursor,
    }))
}

/// Service liveness and queue depth.
#[get("/status")]
pub async fn service_status(ctx: web::Data<AppContext>) -> Result<HttpResponse, ApiError> {
    let queue_depth = ctx.store.queue_depth().await.unwrap_or_else(|e| {
        warn!("queue depth unavailable: {}", e);
        -1
    });

    Ok(HttpResponse::Ok().json(ServiceStatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queue_depth,
    }))
}

/// Prometheus exposition.
#[get("/metrics")]
pub async fn metrics_endpoint(ctx: web::Data<AppContext>) -> Result<HttpResponse, ApiError> {
    let body = ctx
        .metrics
        .export()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}
