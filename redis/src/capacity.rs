//! Capacity counters on Redis hashes.

use boxoffice_core::capacity::{
    CapacityStore, HoldState, RELEASED, Release, ReserveOutcome, ResizeOutcome, RestoreOutcome,
};
use boxoffice_core::{AttemptId, BoxFuture, DateTime, Event, EventId, RequestId, StoreError, TicketCount, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::sync::LazyLock;

// Every script answers `{status, ...}`: -1 no such event, 0 refused, 1 applied,
// 2 left unchanged because of the request's hold.
const NOT_FOUND: i64 = -1;
const REFUSED: i64 = 0;
const HOLD_UNCHANGED: i64 = 2;

// KEYS: event hash, holds hash. ARGV: count, request id, attempt id, released marker.
static RESERVE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local available = redis.call('HGET', KEYS[1], 'available')
        if not available then
            return {-1, 0}
        end
        available = tonumber(available)
        local hold = redis.call('HGET', KEYS[2], ARGV[2])
        if hold == ARGV[3] then
            return {1, available}
        end
        if hold and hold ~= ARGV[4] then
            return {2, available}
        end
        local count = tonumber(ARGV[1])
        if available < count then
            return {0, available}
        end
        redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
        return {1, redis.call('HINCRBY', KEYS[1], 'available', -count)}
        ",
    )
});

// Same KEYS. ARGV: count, request id, attempt id or empty for a booking, released marker.
static RESTORE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local fields = redis.call('HMGET', KEYS[1], 'total', 'available')
        if not fields[1] then
            return {-1, 0}
        end
        local available = tonumber(fields[2])
        local hold = redis.call('HGET', KEYS[2], ARGV[2])
        local releases
        if hold == ARGV[4] then
            releases = false
        elseif ARGV[3] == '' then
            releases = true
        else
            releases = hold == ARGV[3]
        end
        if not releases then
            return {2, available}
        end
        local restored = math.min(tonumber(fields[1]), available + tonumber(ARGV[1]))
        redis.call('HSET', KEYS[1], 'available', restored)
        redis.call('HSET', KEYS[2], ARGV[2], ARGV[4])
        return {1, restored}
        ",
    )
});

static RESIZE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local fields = redis.call('HMGET', KEYS[1], 'total', 'available', 'date')
        if not fields[1] then
            return {-1, 0, 0, ''}
        end
        local sold = tonumber(fields[1]) - tonumber(fields[2])
        local new_total = tonumber(ARGV[1])
        if new_total == 0 or new_total < sold then
            return {0, sold, 0, ''}
        end
        local available = new_total - sold
        redis.call('HSET', KEYS[1], 'total', new_total, 'available', available)
        return {1, new_total, available, fields[3]}
        ",
    )
});

/// Redis-backed [`CapacityStore`].
///
/// Cloning is cheap; clones share the underlying [`ConnectionManager`], which
/// reconnects on its own after a dropped connection.
#[derive(Clone)]
pub struct RedisCapacityStore {
    conn_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisCapacityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCapacityStore").finish_non_exhaustive()
    }
}

impl RedisCapacityStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - `Redis` connection URL (e.g., "<redis://127.0.0.1:6379>")
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid or the server cannot be reached.
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self { conn_manager })
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub const fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }

    fn event_key(event_id: EventId) -> String {
        format!("event:{event_id}")
    }

    fn holds_key(event_id: EventId) -> String {
        format!("event:{event_id}:holds")
    }

    /// Create or overwrite an event record.
    ///
    /// This is a provisioning call: it writes `available` as given and must not race
    /// with live bookings for the same event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the write fails.
    pub async fn register_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let key = Self::event_key(event.id);

        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("total", event.total.to_string()),
                    ("available", event.available.to_string()),
                    ("date", event.date.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| redis_error("Failed to register event", &e))?;

        tracing::info!(event_id = %event.id, total = event.total, "Event registered");
        Ok(())
    }
}

impl CapacityStore for RedisCapacityStore {
    fn reserve<'a>(
        &'a self,
        event_id: EventId,
        count: TicketCount,
        request_id: &'a RequestId,
        attempt: AttemptId,
    ) -> BoxFuture<'a, Result<ReserveOutcome, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let (status, available): (i64, i64) = RESERVE
                .key(Self::event_key(event_id))
                .key(Self::holds_key(event_id))
                .arg(count.get())
                .arg(request_id.as_str())
                .arg(HoldState::Held(attempt).as_stored())
                .arg(RELEASED)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| redis_error("Failed to reserve capacity", &e))?;

            let outcome = match status {
                NOT_FOUND => ReserveOutcome::NotFound,
                REFUSED => ReserveOutcome::Insufficient {
                    available: counter(available)?,
                },
                HOLD_UNCHANGED => ReserveOutcome::HeldByOtherAttempt,
                _ => ReserveOutcome::Reserved {
                    available: counter(available)?,
                },
            };
            tracing::debug!(event_id = %event_id, request_id = %request_id, tickets = count.get(), ?outcome, "Reserve");
            Ok(outcome)
        })
    }

    fn restore<'a>(
        &'a self,
        event_id: EventId,
        count: TicketCount,
        release: &'a Release,
    ) -> BoxFuture<'a, Result<RestoreOutcome, StoreError>> {
        Box::pin(async move {
            let attempt = match release {
                Release::Attempt { attempt, .. } => HoldState::Held(*attempt).as_stored(),
                Release::Booking { .. } => String::new(),
            };
            let mut conn = self.conn_manager.clone();
            let (status, available): (i64, i64) = RESTORE
                .key(Self::event_key(event_id))
                .key(Self::holds_key(event_id))
                .arg(count.get())
                .arg(release.request_id().as_str())
                .arg(attempt)
                .arg(RELEASED)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| redis_error("Failed to restore capacity", &e))?;

            let outcome = match status {
                NOT_FOUND => return Ok(RestoreOutcome::NotFound),
                HOLD_UNCHANGED => RestoreOutcome::AlreadyRestored {
                    available: counter(available)?,
                },
                _ => RestoreOutcome::Restored {
                    available: counter(available)?,
                },
            };
            tracing::debug!(event_id = %event_id, request_id = %release.request_id(), tickets = count.get(), ?outcome, "Restore");
            Ok(outcome)
        })
    }

    fn get(&self, event_id: EventId) -> BoxFuture<'_, Result<Option<Event>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let fields: HashMap<String, String> = conn
                .hgetall(Self::event_key(event_id))
                .await
                .map_err(|e| redis_error("Failed to load event", &e))?;

            if fields.is_empty() {
                return Ok(None);
            }
            let field = |name: &str| {
                fields
                    .get(name)
                    .ok_or_else(|| StoreError::Corrupt(format!("Event {event_id} has no {name} field")))
            };

            Ok(Some(Event {
                id: event_id,
                total: parse_counter(field("total")?)?,
                available: parse_counter(field("available")?)?,
                date: parse_date(field("date")?)?,
            }))
        })
    }

    fn resize(
        &self,
        event_id: EventId,
        new_total: u32,
    ) -> BoxFuture<'_, Result<ResizeOutcome, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let (status, first, available, date): (i64, i64, i64, String) = RESIZE
                .key(Self::event_key(event_id))
                .arg(new_total)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| redis_error("Failed to resize event", &e))?;

            match status {
                NOT_FOUND => Ok(ResizeOutcome::NotFound),
                REFUSED => Ok(ResizeOutcome::BelowSold { sold: counter(first)? }),
                _ => {
                    let event = Event {
                        id: event_id,
                        total: counter(first)?,
                        available: counter(available)?,
                        date: parse_date(&date)?,
                    };
                    tracing::info!(event_id = %event_id, total = event.total, available = event.available, "Event resized");
                    Ok(ResizeOutcome::Resized(event))
                }
            }
        })
    }
}

/// Translate a client error. Replies of the wrong shape mean the record is bad;
/// everything else is treated as the server being unreachable.
fn redis_error(context: &str, error: &redis::RedisError) -> StoreError {
    if error.kind() == redis::ErrorKind::TypeError {
        StoreError::Corrupt(format!("{context}: {error}"))
    } else {
        StoreError::Unavailable(format!("{context}: {error}"))
    }
}

fn counter(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("Capacity counter out of range: {value}")))
}

fn parse_counter(value: &str) -> Result<u32, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("Invalid capacity counter {value:?}")))
}

fn parse_date(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("Invalid event date {value:?}: {e}")))
}
