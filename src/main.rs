use std::io;
use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use diesel::{
    r2d2::{ConnectionManager, Pool},
    PgConnection,
};
use log::{error, info};

use studio_booking::{
    api::{self, AppState},
    config::{Config, StorageBackend},
    gateway::{DbPool, MemoryGateway, PersistenceGateway, PgGateway},
    queue::{BookingEvent, BookingEventKind, SessionQueueService},
    service::RetryPolicy,
};

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    match config.storage {
        StorageBackend::Postgres => {
            let pool = initialize_db_pool(&config)?;
            run(Arc::new(PgGateway::new(pool)), config).await
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage; data is lost on shutdown");
            run(Arc::new(MemoryGateway::new()), config).await
        }
    }
}

async fn run<G: PersistenceGateway>(gateway: Arc<G>, config: Config) -> io::Result<()> {
    let retry = RetryPolicy { attempts: config.retry_attempts, ..RetryPolicy::default() };

    let mut queue = SessionQueueService::new(config.amqp.clone());
    queue
        .initialize()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

    let state = AppState::new(gateway, retry, queue);

    if let Err(e) = state.queue.start_consuming_session_ends(state.bookings.clone()).await {
        error!("Failed to start session end consumer: {:?}", e);
    }

    spawn_completion_sweep(state.clone(), config.sweep_interval);

    let state = web::Data::new(state);
    info!("starting HTTP server at http://{}:{}", config.bind_host, config.bind_port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(api::configure::<G>)
    })
    .bind((config.bind_host.as_str(), config.bind_port))?
    .run()
    .await
}

/// Completes ended sessions at startup and then on every tick.
fn spawn_completion_sweep<G: PersistenceGateway>(state: AppState<G>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let bookings = state.bookings.clone();
            match tokio::task::spawn_blocking(move || bookings.complete_due_sessions()).await {
                Ok(Ok(closures)) => {
                    if !closures.is_empty() {
                        info!("Completion sweep closed {} session(s)", closures.len());
                    }
                    for closure in &closures {
                        let events = BookingEvent::from_closure(BookingEventKind::SessionCompleted, closure);
                        if let Err(e) = state.queue.publish_all(events).await {
                            error!("Failed to publish completion events: {:?}", e);
                        }
                    }
                }
                Ok(Err(e)) => error!("Completion sweep failed: {}", e),
                Err(e) => error!("Completion sweep task panicked: {:?}", e),
            }
        }
    });
}

fn initialize_db_pool(config: &Config) -> io::Result<DbPool> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "DATABASE_URL must be set"))?;
    let manager = ConnectionManager::<PgConnection>::new(url);
    Pool::builder()
        .max_size(config.pool_max_size)
        .connection_timeout(config.connection_timeout)
        .build(manager)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
