use amqprs::{
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicNackArguments, BasicPublishArguments, Channel,
        ExchangeDeclareArguments, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
    consumer::AsyncConsumer,
    BasicProperties, Deliver, FieldTable,
};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AmqpSettings;
use crate::errors::BookingError;
use crate::gateway::PersistenceGateway;
use crate::models::{Booking, BookingOutcome, CancelOutcome, ResizeOutcome, SessionClosure};
use crate::service::BookingService;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const BOOKING_EXCHANGE: &str = "booking.events";
pub const SESSION_END_TIMER_QUEUE: &str = "session.end.timer";
pub const SESSION_END_QUEUE: &str = "session.ends";

/// Delay before retrying a session end that arrived early.
const EARLY_END_RETRY_SECS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingEventKind {
    #[serde(rename = "booking.confirmed")]
    BookingConfirmed,
    #[serde(rename = "booking.waitlisted")]
    BookingWaitlisted,
    #[serde(rename = "booking.cancelled")]
    BookingCancelled,
    #[serde(rename = "booking.promoted")]
    BookingPromoted,
    #[serde(rename = "session.cancelled")]
    SessionCancelled,
    #[serde(rename = "session.completed")]
    SessionCompleted,
}

impl BookingEventKind {
    pub fn routing_key(&self) -> &'static str {
        match self {
            BookingEventKind::BookingConfirmed => "booking.confirmed",
            BookingEventKind::BookingWaitlisted => "booking.waitlisted",
            BookingEventKind::BookingCancelled => "booking.cancelled",
            BookingEventKind::BookingPromoted => "booking.promoted",
            BookingEventKind::SessionCancelled => "session.cancelled",
            BookingEventKind::SessionCompleted => "session.completed",
        }
    }
}

/// A committed state change, published after the atomic unit that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingEvent {
    pub kind: BookingEventKind,
    pub session_id: i32,
    pub booking_id: Option<i32>,
    pub member_id: Option<String>,
    pub waitlist_position: Option<i32>,
    pub occurred_at: DateTime<Utc>,
}

impl BookingEvent {
    fn for_booking(kind: BookingEventKind, booking: &Booking) -> Self {
        Self {
            kind,
            session_id: booking.session_id,
            booking_id: Some(booking.booking_id),
            member_id: Some(booking.member_id.clone()),
            waitlist_position: booking.waitlist_position,
            occurred_at: Utc::now(),
        }
    }

    pub fn from_outcome(session_id: i32, member_id: &str, outcome: &BookingOutcome) -> Self {
        let (kind, position) = match outcome {
            BookingOutcome::Confirmed { .. } => (BookingEventKind::BookingConfirmed, None),
            BookingOutcome::Waitlisted { position, .. } => (BookingEventKind::BookingWaitlisted, Some(*position)),
        };
        Self {
            kind,
            session_id,
            booking_id: Some(outcome.booking_id()),
            member_id: Some(member_id.to_string()),
            waitlist_position: position,
            occurred_at: Utc::now(),
        }
    }

    pub fn from_cancellation(outcome: &CancelOutcome) -> Vec<Self> {
        let mut events = vec![Self::for_booking(BookingEventKind::BookingCancelled, &outcome.cancelled)];
        if let Some(promoted) = &outcome.promoted {
            events.push(Self::for_booking(BookingEventKind::BookingPromoted, promoted));
        }
        events
    }

    pub fn from_resize(outcome: &ResizeOutcome) -> Vec<Self> {
        outcome
            .promoted
            .iter()
            .map(|b| Self::for_booking(BookingEventKind::BookingPromoted, b))
            .collect()
    }

    /// One session event followed by a cancellation event per booking the closure cancelled.
    pub fn from_closure(kind: BookingEventKind, closure: &SessionClosure) -> Vec<Self> {
        let mut events = Vec::with_capacity(closure.cancelled_bookings.len() + 1);
        events.push(Self {
            kind,
            session_id: closure.session.session_id,
            booking_id: None,
            member_id: None,
            waitlist_position: None,
            occurred_at: Utc::now(),
        });
        events.extend(
            closure
                .cancelled_bookings
                .iter()
                .map(|b| Self::for_booking(BookingEventKind::BookingCancelled, b)),
        );
        events
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEndMessage {
    pub session_id: i32,
    pub ends_at: DateTime<Utc>,
}

/// Milliseconds until `ends_at`, or `None` when it has already passed.
pub fn timer_ttl_ms(ends_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<i64> {
    let delay = (ends_at - now).num_milliseconds();
    (delay > 0).then_some(delay)
}

pub fn as_utc(timestamp: NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(timestamp, Utc)
}

struct SessionEndConsumer<G> {
    bookings: BookingService<G>,
    queue: SessionQueueService,
}

#[async_trait::async_trait]
impl<G: PersistenceGateway> AsyncConsumer for SessionEndConsumer<G> {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        if let Err(e) = self.handle_session_end(channel, deliver, content).await {
            error!("Failed to process session end message: {:?}", e);
        }
    }
}

impl<G: PersistenceGateway> SessionEndConsumer<G> {
    async fn handle_session_end(&mut self, channel: &Channel, deliver: Deliver, content: Vec<u8>) -> Result<()> {
        let tag = deliver.delivery_tag();
        let message = match serde_json::from_slice::<SessionEndMessage>(&content) {
            Ok(message) => message,
            Err(e) => {
                // malformed, never requeue
                channel.basic_nack(BasicNackArguments::new(tag, false, false)).await?;
                return Err(e.into());
            }
        };

        let bookings = self.bookings.clone();
        let session_id = message.session_id;
        let result = tokio::task::spawn_blocking(move || bookings.complete_session(session_id)).await;

        match result {
            Ok(Ok(closure)) => {
                info!("Session {} completed from its end timer", session_id);
                channel.basic_ack(BasicAckArguments::new(tag, false)).await?;
                self.queue
                    .publish_all(BookingEvent::from_closure(BookingEventKind::SessionCompleted, &closure))
                    .await?;
            }
            Ok(Err(BookingError::InvalidRequest(reason))) => {
                let retry_at = message.ends_at.max(Utc::now() + Duration::seconds(EARLY_END_RETRY_SECS));
                warn!("Session {} end timer fired early ({}), rescheduling for {}", session_id, reason, retry_at);
                self.queue.schedule_session_end(session_id, retry_at).await?;
                channel.basic_ack(BasicAckArguments::new(tag, false)).await?;
            }
            Ok(Err(BookingError::NotFound { .. })) => {
                debug!("Session {} no longer exists, dropping its end timer", session_id);
                channel.basic_ack(BasicAckArguments::new(tag, false)).await?;
            }
            Ok(Err(e)) if e.is_transient() => {
                channel.basic_nack(BasicNackArguments::new(tag, false, true)).await?;
                return Err(e.into());
            }
            Ok(Err(e)) => {
                channel.basic_ack(BasicAckArguments::new(tag, false)).await?;
                return Err(e.into());
            }
            Err(e) => {
                channel.basic_nack(BasicNackArguments::new(tag, false, true)).await?;
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// Publishes booking events and drives session end timers over AMQP.
/// Every method is a no-op while the queue is disabled.
#[derive(Clone)]
pub struct SessionQueueService {
    settings: AmqpSettings,
    connection: Option<Arc<Connection>>,
    booking_exchange: String,
    session_end_timer_queue: String,
    session_end_queue: String,
}

impl SessionQueueService {
    pub fn new(settings: AmqpSettings) -> Self {
        Self {
            settings,
            connection: None,
            booking_exchange: BOOKING_EXCHANGE.to_string(),
            session_end_timer_queue: SESSION_END_TIMER_QUEUE.to_string(),
            session_end_queue: SESSION_END_QUEUE.to_string(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(AmqpSettings::disabled())
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub async fn initialize(&mut self) -> Result<()> {
        if !self.settings.enabled {
            info!("AMQP disabled; booking events will not be published");
            return Ok(());
        }

        info!("Connecting to RabbitMQ at {}:{}", self.settings.host, self.settings.port);
        let connection = Connection::open(&OpenConnectionArguments::new(
            &self.settings.host,
            self.settings.port,
            &self.settings.user,
            &self.settings.password,
        ))
        .await?;
        connection.register_callback(DefaultConnectionCallback).await?;

        let setup_channel = connection.open_channel(None).await?;
        setup_channel.register_callback(DefaultChannelCallback).await?;

        setup_channel
            .exchange_declare(ExchangeDeclareArguments::new(&self.booking_exchange, "topic").durable(true).finish())
            .await?;

        setup_channel
            .queue_declare(QueueDeclareArguments::new(&self.session_end_queue).durable(true).finish())
            .await?;

        // expired timers go through the default exchange straight to session.ends
        let mut args = FieldTable::new();
        args.insert("x-dead-letter-exchange".try_into()?, "".into());
        args.insert("x-dead-letter-routing-key".try_into()?, self.session_end_queue.clone().into());
        setup_channel
            .queue_declare(
                QueueDeclareArguments::new(&self.session_end_timer_queue)
                    .durable(true)
                    .arguments(args)
                    .finish(),
            )
            .await?;

        self.connection = Some(Arc::new(connection));
        let _ = setup_channel.close().await;

        info!("Connected to RabbitMQ and declared booking exchange and session timer queues");
        Ok(())
    }

    async fn get_fresh_channel(&self) -> Result<Channel> {
        match &self.connection {
            Some(connection) => {
                let channel = connection.open_channel(None).await?;
                channel.register_callback(DefaultChannelCallback).await?;
                Ok(channel)
            }
            None => Err("RabbitMQ connection not initialized".into()),
        }
    }

    // Publishing never fails the caller: the state change is already committed.
    async fn safe_queue_operation<F, Fut>(&self, operation: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let max_retries = 2;
        let mut delay_ms = 25;

        for attempt in 1..=max_retries {
            match operation().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_retries => {
                    warn!("Queue operation failed (attempt {}/{}), retrying: {:?}", attempt, max_retries, e);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    delay_ms *= 2;
                }
                Err(e) => error!("Queue operation failed after {} attempts, giving up: {:?}", max_retries, e),
            }
        }
        Ok(())
    }

    pub async fn publish_booking_event(&self, event: &BookingEvent) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }

        let payload = serde_json::to_vec(event)?;
        let routing_key = event.kind.routing_key();

        self.safe_queue_operation(|| {
            let payload = payload.clone();
            async move {
                let channel = self.get_fresh_channel().await?;
                let properties = BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json")
                    .finish();
                channel
                    .basic_publish(properties, payload, BasicPublishArguments::new(&self.booking_exchange, routing_key))
                    .await?;
                let _ = channel.close().await;
                debug!("Published {} for session {}", routing_key, event.session_id);
                Ok(())
            }
        })
        .await
    }

    pub async fn publish_all(&self, events: Vec<BookingEvent>) -> Result<()> {
        for event in &events {
            self.publish_booking_event(event).await?;
        }
        Ok(())
    }

    /// Arms the end timer for a session. Sessions that have already ended go straight
    /// to the completion queue.
    pub async fn schedule_session_end(&self, session_id: i32, ends_at: DateTime<Utc>) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }

        let payload = serde_json::to_vec(&SessionEndMessage { session_id, ends_at })?;

        self.safe_queue_operation(|| {
            let payload = payload.clone();
            async move {
                let channel = self.get_fresh_channel().await?;
                let (properties, queue) = match timer_ttl_ms(ends_at, Utc::now()) {
                    Some(ttl_ms) => (
                        BasicProperties::default()
                            .with_delivery_mode(2)
                            .with_expiration(&ttl_ms.to_string())
                            .finish(),
                        &self.session_end_timer_queue,
                    ),
                    None => (BasicProperties::default().with_delivery_mode(2).finish(), &self.session_end_queue),
                };

                channel.basic_publish(properties, payload, BasicPublishArguments::new("", queue)).await?;
                let _ = channel.close().await;
                info!("Session {} end timer set for {} on '{}'", session_id, ends_at, queue);
                Ok(())
            }
        })
        .await
    }

    pub async fn start_consuming_session_ends<G: PersistenceGateway>(&self, bookings: BookingService<G>) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }

        let channel = self.get_fresh_channel().await?;
        let consumer_tag = format!("session_end_consumer_{}", Uuid::new_v4());
        let args = BasicConsumeArguments::new(&self.session_end_queue, &consumer_tag)
            .manual_ack(true)
            .finish();
        let consumer = SessionEndConsumer { bookings, queue: self.clone() };
        let queue_name = self.session_end_queue.clone();

        tokio::spawn(async move {
            match channel.basic_consume(consumer, args).await {
                Ok(_) => {
                    info!("Session end consumer listening on '{}'", queue_name);
                    // the channel must outlive the consumer
                    loop {
                        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                    }
                }
                Err(e) => error!("Failed to start session end consumer: {:?}", e),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookingStatus, ClassSession, SessionStatus};
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        as_utc(NaiveDate::from_ymd_opt(2030, 6, 1).unwrap().and_hms_opt(h, m, 0).unwrap())
    }

    fn booking(id: i32, status: BookingStatus, position: Option<i32>) -> Booking {
        let ts = at(9, 0).naive_utc();
        Booking {
            booking_id: id,
            session_id: 7,
            member_id: format!("m{}", id),
            requested_at: ts,
            status,
            waitlist_position: position,
            created_at: ts,
            cancelled_at: None,
        }
    }

    #[test]
    fn routing_keys_match_serialized_kind() {
        for kind in [
            BookingEventKind::BookingConfirmed,
            BookingEventKind::BookingWaitlisted,
            BookingEventKind::BookingCancelled,
            BookingEventKind::BookingPromoted,
            BookingEventKind::SessionCancelled,
            BookingEventKind::SessionCompleted,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), serde_json::json!(kind.routing_key()));
        }
    }

    #[test]
    fn ttl_is_none_once_the_session_has_ended() {
        assert_eq!(timer_ttl_ms(at(10, 0), at(9, 0)), Some(3_600_000));
        assert_eq!(timer_ttl_ms(at(9, 0), at(9, 0)), None);
        assert_eq!(timer_ttl_ms(at(8, 0), at(9, 0)), None);
    }

    #[test]
    fn waitlisted_outcome_carries_its_position() {
        let event = BookingEvent::from_outcome(7, "m3", &BookingOutcome::Waitlisted { booking_id: 3, position: 2 });
        assert_eq!(event.kind, BookingEventKind::BookingWaitlisted);
        assert_eq!(event.booking_id, Some(3));
        assert_eq!(event.waitlist_position, Some(2));
    }

    #[test]
    fn cancellation_with_promotion_yields_two_events() {
        let outcome = CancelOutcome {
            cancelled: booking(1, BookingStatus::Cancelled, None),
            promoted: Some(booking(2, BookingStatus::Confirmed, None)),
            session_status: SessionStatus::Full,
        };
        let kinds: Vec<_> = BookingEvent::from_cancellation(&outcome).iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![BookingEventKind::BookingCancelled, BookingEventKind::BookingPromoted]);
    }

    #[test]
    fn closure_lists_session_event_first() {
        let ts = at(9, 0).naive_utc();
        let closure = SessionClosure {
            session: ClassSession {
                session_id: 7,
                title: "Barre".to_string(),
                instructor_id: "inst-1".to_string(),
                start_timestamp: ts,
                duration_minutes: 45,
                capacity: 1,
                location: "Studio B".to_string(),
                status: SessionStatus::Completed,
                created_at: ts,
            },
            cancelled_bookings: vec![booking(4, BookingStatus::Cancelled, None)],
        };
        let events = BookingEvent::from_closure(BookingEventKind::SessionCompleted, &closure);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, BookingEventKind::SessionCompleted);
        assert_eq!(events[0].booking_id, None);
        assert_eq!(events[1].booking_id, Some(4));
    }

    #[tokio::test]
    async fn disabled_queue_accepts_everything_without_a_broker() {
        let mut queue = SessionQueueService::disabled();
        queue.initialize().await.unwrap();
        assert!(!queue.is_enabled());

        let event = BookingEvent::from_outcome(1, "m1", &BookingOutcome::Confirmed { booking_id: 1 });
        queue.publish_booking_event(&event).await.unwrap();
        queue.schedule_session_end(1, at(10, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn enabled_queue_without_connection_swallows_publish_failures() {
        let queue = SessionQueueService::new(AmqpSettings { enabled: true, ..AmqpSettings::disabled() });
        let event = BookingEvent::from_outcome(1, "m1", &BookingOutcome::Confirmed { booking_id: 1 });
        assert!(queue.publish_booking_event(&event).await.is_ok());
    }
}
