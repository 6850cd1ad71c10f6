//! Ledger Store on `PostgreSQL`.
//!
//! Idempotency rests on the `bookings_request_id_key` unique constraint: a second
//! insert with the same request id blocks until the first transaction ends, then
//! fails with a unique violation, which surfaces as [`StoreError::DuplicateRequest`].
//!
//! Status changes are a single `UPDATE ... WHERE status = $from`. Under the default
//! READ COMMITTED isolation a concurrent update of the same row waits for the row
//! lock and then re-evaluates the predicate, so exactly one of two racing
//! cancellations sees its row.

use crate::{is_unique_violation, store_error};
use boxoffice_core::ledger::{IntentState, LedgerStore, LedgerTransaction, ReservationIntent};
use boxoffice_core::{
    Booking, BookingId, BookingStatus, BoxFuture, DateTime, EventId, NewBooking, Page, RequestId,
    StoreError, TicketCount, UserId, Utc,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

const BOOKING_COLUMNS: &str = "id, event_id, user_id, tickets, status, request_id, created_at, updated_at";
const INTENT_COLUMNS: &str = "request_id, event_id, user_id, tickets, state, created_at, resolved_at";

/// `PostgreSQL` Ledger Store.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl LedgerStore for PostgresLedgerStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn LedgerTransaction>, StoreError>> {
        Box::pin(async move {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| store_error("Failed to start transaction", &e))?;
            let tx: Box<dyn LedgerTransaction> = Box::new(PgLedgerTransaction { tx });
            Ok(tx)
        })
    }

    fn find_by_id(&self, id: BookingId) -> BoxFuture<'_, Result<Option<Booking>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| store_error("Failed to load booking", &e))?;
            row.as_ref().map(row_to_booking).transpose()
        })
    }

    fn find_by_request_id<'a>(
        &'a self,
        request_id: &'a RequestId,
    ) -> BoxFuture<'a, Result<Option<Booking>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE request_id = $1"))
                .bind(request_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| store_error("Failed to look up request id", &e))?;
            row.as_ref().map(row_to_booking).transpose()
        })
    }

    fn find_by_user(&self, user_id: UserId, page: Page) -> BoxFuture<'_, Result<Vec<Booking>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {BOOKING_COLUMNS} FROM bookings
                 WHERE user_id = $1
                 ORDER BY created_at DESC, id DESC
                 LIMIT $2 OFFSET $3"
            ))
            .bind(*user_id.as_uuid())
            .bind(i64::from(page.limit))
            .bind(i64::from(page.offset))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error("Failed to list bookings", &e))?;
            rows.iter().map(row_to_booking).collect()
        })
    }

    fn confirmed_tickets(&self, event_id: EventId) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let (sum,): (i64,) = sqlx::query_as(
                r"
                SELECT COALESCE(SUM(tickets), 0)::BIGINT
                FROM bookings
                WHERE event_id = $1 AND status = 'confirmed'
                ",
            )
            .bind(*event_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_error("Failed to sum confirmed tickets", &e))?;
            u64::try_from(sum).map_err(|_| StoreError::Corrupt(format!("Negative ticket sum {sum}")))
        })
    }

    fn record_intent(&self, intent: ReservationIntent) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            // A client retry reuses its request id; only ticketless outcomes reopen
            sqlx::query(
                r"
                INSERT INTO reservation_intents
                    (request_id, event_id, user_id, tickets, state, created_at, resolved_at)
                VALUES ($1, $2, $3, $4, 'pending', $5, NULL)
                ON CONFLICT (request_id) DO UPDATE
                SET event_id = EXCLUDED.event_id,
                    user_id = EXCLUDED.user_id,
                    tickets = EXCLUDED.tickets,
                    state = 'pending',
                    created_at = EXCLUDED.created_at,
                    resolved_at = NULL
                WHERE reservation_intents.state IN ('rejected', 'compensated')
                ",
            )
            .bind(intent.request_id.as_str())
            .bind(*intent.event_id.as_uuid())
            .bind(*intent.user_id.as_uuid())
            .bind(tickets_column(intent.tickets)?)
            .bind(intent.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Failed to record reservation intent", &e))?;
            Ok(())
        })
    }

    fn resolve_intent<'a>(
        &'a self,
        request_id: &'a RequestId,
        state: IntentState,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE reservation_intents
                SET state = $2, resolved_at = $3
                WHERE request_id = $1
                ",
            )
            .bind(request_id.as_str())
            .bind(state.as_str())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Failed to resolve reservation intent", &e))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    fn stale_intents(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<ReservationIntent>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {INTENT_COLUMNS} FROM reservation_intents
                 WHERE state = 'pending' AND created_at < $1
                 ORDER BY created_at ASC
                 LIMIT $2"
            ))
            .bind(older_than)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error("Failed to list stale intents", &e))?;
            rows.iter().map(row_to_intent).collect()
        })
    }
}

/// Open transaction on a pooled connection.
///
/// Dropping it without `commit` returns the connection with the transaction rolled back.
pub struct PgLedgerTransaction {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgLedgerTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLedgerTransaction").finish_non_exhaustive()
    }
}

impl LedgerTransaction for PgLedgerTransaction {
    fn create_booking(&mut self, booking: NewBooking) -> BoxFuture<'_, Result<Booking, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "INSERT INTO bookings
                    (id, event_id, user_id, tickets, status, request_id, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, 'confirmed', $5, $6, $6)
                 RETURNING {BOOKING_COLUMNS}"
            ))
            .bind(*booking.id.as_uuid())
            .bind(*booking.event_id.as_uuid())
            .bind(*booking.user_id.as_uuid())
            .bind(tickets_column(booking.tickets)?)
            .bind(booking.request_id.as_str())
            .bind(booking.created_at)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateRequest(booking.request_id.clone())
                } else {
                    store_error("Failed to insert booking", &e)
                }
            })?;
            row_to_booking(&row)
        })
    }

    fn set_status(
        &mut self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Booking, StoreError>> {
        Box::pin(async move {
            let updated = sqlx::query(&format!(
                "UPDATE bookings
                 SET status = $3, updated_at = $4
                 WHERE id = $1 AND status = $2
                 RETURNING {BOOKING_COLUMNS}"
            ))
            .bind(*id.as_uuid())
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(at)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| store_error("Failed to update booking status", &e))?;

            if let Some(row) = updated {
                return row_to_booking(&row);
            }

            // Nothing matched: either the row is gone or it moved on
            let actual: Option<(String,)> = sqlx::query_as("SELECT status FROM bookings WHERE id = $1")
                .bind(*id.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| store_error("Failed to read booking status", &e))?;
            match actual {
                None => Err(StoreError::NotFound),
                Some((status,)) => Err(StoreError::StatusConflict {
                    id,
                    expected: from,
                    actual: BookingStatus::parse(&status)?,
                }),
            }
        })
    }

    fn find_by_id(&mut self, id: BookingId) -> BoxFuture<'_, Result<Option<Booking>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
                .bind(*id.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| store_error("Failed to load booking", &e))?;
            row.as_ref().map(row_to_booking).transpose()
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move {
            let Self { tx } = *self;
            tx.commit()
                .await
                .map_err(|e| store_error("Failed to commit transaction", &e))
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move {
            let Self { tx } = *self;
            tx.rollback()
                .await
                .map_err(|e| store_error("Failed to roll back transaction", &e))
        })
    }
}

fn tickets_column(tickets: TicketCount) -> Result<i32, StoreError> {
    i32::try_from(tickets.get())
        .map_err(|_| StoreError::Corrupt(format!("Ticket count {tickets} does not fit the tickets column")))
}

fn tickets_from_column(value: i32) -> Result<TicketCount, StoreError> {
    u32::try_from(value)
        .ok()
        .and_then(|count| TicketCount::new(count).ok())
        .ok_or_else(|| StoreError::Corrupt(format!("Invalid ticket count {value}")))
}

pub(crate) fn decode<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| store_error("Failed to decode ledger row", &e))
}

fn row_to_booking(row: &PgRow) -> Result<Booking, StoreError> {
    let request_id: String = decode(row, "request_id")?;
    let status: String = decode(row, "status")?;
    Ok(Booking {
        id: BookingId::from_uuid(decode(row, "id")?),
        event_id: EventId::from_uuid(decode(row, "event_id")?),
        user_id: UserId::from_uuid(decode(row, "user_id")?),
        tickets: tickets_from_column(decode(row, "tickets")?)?,
        status: BookingStatus::parse(&status)?,
        request_id: RequestId::new(&request_id)
            .map_err(|e| StoreError::Corrupt(format!("Invalid request id {request_id:?}: {e}")))?,
        created_at: decode(row, "created_at")?,
        updated_at: decode(row, "updated_at")?,
    })
}

fn row_to_intent(row: &PgRow) -> Result<ReservationIntent, StoreError> {
    let request_id: String = decode(row, "request_id")?;
    let state: String = decode(row, "state")?;
    Ok(ReservationIntent {
        request_id: RequestId::new(&request_id)
            .map_err(|e| StoreError::Corrupt(format!("Invalid request id {request_id:?}: {e}")))?,
        event_id: EventId::from_uuid(decode(row, "event_id")?),
        user_id: UserId::from_uuid(decode(row, "user_id")?),
        tickets: tickets_from_column(decode(row, "tickets")?)?,
        state: IntentState::parse(&state)?,
        created_at: decode(row, "created_at")?,
        resolved_at: decode(row, "resolved_at")?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ticket_column_bounds() {
        assert!(tickets_from_column(0).is_err());
        assert!(tickets_from_column(-3).is_err());
        assert!(tickets_from_column(11).is_err());
        assert!(matches!(tickets_from_column(4), Ok(count) if count.get() == 4));
    }

    #[test]
    fn every_ticket_count_survives_the_column() {
        for n in 1..=10 {
            let tickets = TicketCount::new(n).unwrap();
            let column = tickets_column(tickets).unwrap();
            assert_eq!(tickets_from_column(column).unwrap(), tickets);
        }
    }
}
