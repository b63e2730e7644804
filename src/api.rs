//! HTTP surface. Handlers are generic over the storage gateway so the same routes run
//! against PostgreSQL in production and the in-memory store in tests.

use std::sync::Arc;

use actix_web::{error, web, HttpResponse, ResponseError};
use log::{error, warn};

use crate::catalog::ClassCatalog;
use crate::errors::{BookingError, ErrorBody};
use crate::gateway::PersistenceGateway;
use crate::identity::Caller;
use crate::models::{
    ApiResponse, BookingStatus, CancelBookingResponse, ResizeSessionRequest, ScheduleSessionRequest, SessionFilter,
};
use crate::queue::{as_utc, BookingEvent, BookingEventKind, SessionQueueService};
use crate::service::{BookingService, RetryPolicy};

pub struct AppState<G> {
    pub bookings: BookingService<G>,
    pub catalog: ClassCatalog<G>,
    pub queue: SessionQueueService,
}

impl<G> Clone for AppState<G> {
    fn clone(&self) -> Self {
        Self { bookings: self.bookings.clone(), catalog: self.catalog.clone(), queue: self.queue.clone() }
    }
}

impl<G: PersistenceGateway> AppState<G> {
    pub fn new(gateway: Arc<G>, retry: RetryPolicy, queue: SessionQueueService) -> Self {
        Self {
            bookings: BookingService::new(gateway.clone()).with_retry_policy(retry),
            catalog: ClassCatalog::new(gateway),
            queue,
        }
    }
}

pub fn configure<G: PersistenceGateway>(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(path_config())
        .app_data(query_config())
        .service(
            web::resource("/sessions")
                .route(web::post().to(schedule_session::<G>))
                .route(web::get().to(list_sessions::<G>)),
        )
        .service(
            web::resource("/sessions/{session_id}")
                .route(web::get().to(get_session::<G>))
                .route(web::delete().to(delete_session::<G>)),
        )
        .service(web::resource("/sessions/{session_id}/cancel").route(web::post().to(cancel_session::<G>)))
        .service(web::resource("/sessions/{session_id}/capacity").route(web::put().to(resize_session::<G>)))
        .service(web::resource("/sessions/{session_id}/availability").route(web::get().to(session_availability::<G>)))
        .service(
            web::resource("/sessions/{session_id}/bookings")
                .route(web::get().to(session_roster::<G>))
                .route(web::post().to(request_booking::<G>)),
        )
        .service(web::resource("/bookings/{booking_id}").route(web::get().to(get_booking::<G>)))
        .service(web::resource("/bookings/{booking_id}/cancel").route(web::post().to(cancel_booking::<G>)))
        .service(web::resource("/members/me/bookings").route(web::get().to(member_bookings::<G>)));
}

/// Malformed bodies get the same `{code, message}` shape as every other failure.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let response = match err {
            error::JsonPayloadError::ContentType => HttpResponse::UnsupportedMediaType().json(ErrorBody {
                code: "unsupported_media_type",
                message: "expected application/json".to_string(),
            }),
            error::JsonPayloadError::Deserialize(ref e) => {
                BookingError::InvalidRequest(e.to_string()).error_response()
            }
            ref other => BookingError::InvalidRequest(other.to_string()).error_response(),
        };
        error::InternalError::from_response(err, response).into()
    })
}

fn path_config() -> web::PathConfig {
    web::PathConfig::default().error_handler(|err, _req| {
        let response = BookingError::InvalidRequest(format!("invalid identifier: {}", err)).error_response();
        error::InternalError::from_response(err, response).into()
    })
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _req| {
        let response = BookingError::InvalidRequest(err.to_string()).error_response();
        error::InternalError::from_response(err, response).into()
    })
}

/// Runs blocking store work off the async workers and logs failures.
async fn run_blocking<T, F>(operation: &'static str, f: F) -> Result<T, BookingError>
where
    F: FnOnce() -> Result<T, BookingError> + Send + 'static,
    T: Send + 'static,
{
    let result = web::block(f)
        .await
        .map_err(|e| BookingError::Persistence(format!("blocking task failed: {}", e)))
        .and_then(|r| r);

    if let Err(e) = &result {
        if e.status_code().is_server_error() {
            error!("Failed to {}: {}", operation, e);
        } else {
            warn!("Rejected {}: {}", operation, e);
        }
    }
    result
}

fn publish(queue: &SessionQueueService, events: Vec<BookingEvent>) {
    if !queue.is_enabled() || events.is_empty() {
        return;
    }
    let queue = queue.clone();
    tokio::spawn(async move {
        if let Err(e) = queue.publish_all(events).await {
            error!("Failed to publish booking events: {:?}", e);
        }
    });
}

async fn schedule_session<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    caller: Caller,
    form: web::Json<ScheduleSessionRequest>,
) -> Result<HttpResponse, BookingError> {
    caller.require_admin()?;
    let catalog = state.catalog.clone();
    let session = run_blocking("schedule session", move || catalog.schedule(&form)).await?;

    if state.queue.is_enabled() {
        let queue = state.queue.clone();
        let (session_id, ends_at) = (session.session_id, as_utc(session.ends_at()));
        tokio::spawn(async move {
            if let Err(e) = queue.schedule_session_end(session_id, ends_at).await {
                error!("Failed to schedule end timer for session {}: {:?}", session_id, e);
            }
        });
    }

    Ok(HttpResponse::Created().json(session))
}

async fn list_sessions<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    _caller: Caller,
    filter: web::Query<SessionFilter>,
) -> Result<HttpResponse, BookingError> {
    let catalog = state.catalog.clone();
    let sessions = run_blocking("list sessions", move || catalog.list(&filter)).await?;
    Ok(HttpResponse::Ok().json(sessions))
}

async fn get_session<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    _caller: Caller,
    path: web::Path<i32>,
) -> Result<HttpResponse, BookingError> {
    let session_id = path.into_inner();
    let catalog = state.catalog.clone();
    let session = run_blocking("get session", move || catalog.get(session_id)).await?;
    Ok(HttpResponse::Ok().json(session))
}

async fn delete_session<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    caller: Caller,
    path: web::Path<i32>,
) -> Result<HttpResponse, BookingError> {
    caller.require_admin()?;
    let session_id = path.into_inner();
    let catalog = state.catalog.clone();
    run_blocking("delete session", move || catalog.delete(session_id)).await?;
    Ok(HttpResponse::Ok().json(ApiResponse { message: format!("session {} deleted", session_id) }))
}

async fn cancel_session<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    caller: Caller,
    path: web::Path<i32>,
) -> Result<HttpResponse, BookingError> {
    caller.require_admin()?;
    let session_id = path.into_inner();
    let bookings = state.bookings.clone();
    let closure = run_blocking("cancel session", move || bookings.cancel_session(session_id)).await?;

    publish(&state.queue, BookingEvent::from_closure(BookingEventKind::SessionCancelled, &closure));
    Ok(HttpResponse::Ok().json(closure))
}

async fn resize_session<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    caller: Caller,
    path: web::Path<i32>,
    form: web::Json<ResizeSessionRequest>,
) -> Result<HttpResponse, BookingError> {
    caller.require_admin()?;
    let session_id = path.into_inner();
    let capacity = form.capacity;
    let bookings = state.bookings.clone();
    let outcome = run_blocking("resize session", move || bookings.resize_session(session_id, capacity)).await?;

    publish(&state.queue, BookingEvent::from_resize(&outcome));
    Ok(HttpResponse::Ok().json(outcome))
}

async fn session_availability<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    _caller: Caller,
    path: web::Path<i32>,
) -> Result<HttpResponse, BookingError> {
    let session_id = path.into_inner();
    let catalog = state.catalog.clone();
    let availability = run_blocking("read availability", move || catalog.availability(session_id)).await?;
    Ok(HttpResponse::Ok().json(availability))
}

async fn session_roster<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    caller: Caller,
    path: web::Path<i32>,
) -> Result<HttpResponse, BookingError> {
    caller.require_admin()?;
    let session_id = path.into_inner();
    let catalog = state.catalog.clone();
    let roster = run_blocking("read roster", move || catalog.roster(session_id)).await?;
    Ok(HttpResponse::Ok().json(roster))
}

async fn request_booking<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    caller: Caller,
    path: web::Path<i32>,
) -> Result<HttpResponse, BookingError> {
    let session_id = path.into_inner();
    let bookings = state.bookings.clone();
    let member_id = caller.member_id.clone();
    let outcome = run_blocking("request booking", move || bookings.request_booking(&member_id, session_id)).await?;

    publish(&state.queue, vec![BookingEvent::from_outcome(session_id, &caller.member_id, &outcome)]);
    Ok(HttpResponse::Created().json(outcome))
}

async fn get_booking<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    caller: Caller,
    path: web::Path<i32>,
) -> Result<HttpResponse, BookingError> {
    let booking_id = path.into_inner();
    let catalog = state.catalog.clone();
    let booking = run_blocking("read booking", move || catalog.booking(booking_id, &caller)).await?;
    Ok(HttpResponse::Ok().json(booking))
}

async fn cancel_booking<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    caller: Caller,
    path: web::Path<i32>,
) -> Result<HttpResponse, BookingError> {
    let booking_id = path.into_inner();
    let bookings = state.bookings.clone();
    let outcome = run_blocking("cancel booking", move || bookings.cancel_booking(booking_id, &caller)).await?;

    publish(&state.queue, BookingEvent::from_cancellation(&outcome));
    Ok(HttpResponse::Ok().json(CancelBookingResponse { status: BookingStatus::Cancelled, booking_id }))
}

async fn member_bookings<G: PersistenceGateway>(
    state: web::Data<AppState<G>>,
    caller: Caller,
) -> Result<HttpResponse, BookingError> {
    let catalog = state.catalog.clone();
    let bookings = run_blocking("list member bookings", move || catalog.member_bookings(&caller.member_id)).await?;
    Ok(HttpResponse::Ok().json(bookings))
}
