use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use super::{appointment_code, AppointmentStore, CatalogService, ConversationStore};
use crate::error::StoreError;
use crate::types::{
    Appointment, AppointmentStatus, CancelOutcome, ChatMessage, Conversation, ConversationOwner,
    ConversationState, Location, ReserveOutcome, SenderKind, Service, Slot,
};

const CONVERSATION_COLUMNS: &str = "id, seq, kind, state, session_id, user_id, operator_id, \
     created_at, updated_at, waiting_since, transferred_at, closed_at";

const APPOINTMENT_SELECT: &str = "SELECT a.id, a.code, a.slot_id, a.service_id, s.name AS service_name, \
            a.user_id, sl.date, sl.start_time, l.name AS location_name, a.status, a.created_at, a.cancelled_at \
     FROM appointments a \
     JOIN services s ON s.id = a.service_id \
     JOIN slots sl ON sl.id = a.slot_id \
     LEFT JOIN locations l ON l.id = sl.location_id";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Partial unique index backing "one scheduled appointment per user and slot".
const ONE_PER_USER_SLOT: &str = "appointments_one_per_user_slot";

fn violates_one_per_user_slot(unique_violation: bool, constraint: Option<&str>) -> bool {
    unique_violation && constraint == Some(ONE_PER_USER_SLOT)
}

/// A concurrent commit of the same slot by the same user that slipped past
/// the duplicate pre-check.
fn is_duplicate_booking(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            violates_one_per_user_slot(db.is_unique_violation(), db.constraint())
        }
        _ => false,
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| StoreError::Corrupt(format!("bad date {raw:?}")))
}

fn conversation_from_row(row: &PgRow) -> Result<Conversation, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        seq: row.try_get("seq")?,
        kind: row.try_get("kind")?,
        state: ConversationState::parse(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("conversation state {state:?}")))?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        operator_id: row.try_get("operator_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        waiting_since: row.try_get("waiting_since")?,
        transferred_at: row.try_get("transferred_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<ChatMessage, StoreError> {
    let sender: String = row.try_get("sender")?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender: SenderKind::parse(&sender)
            .ok_or_else(|| StoreError::Corrupt(format!("message sender {sender:?}")))?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        sent_at: row.try_get("sent_at")?,
        read: row.try_get("read")?,
    })
}

fn service_from_row(row: &PgRow) -> Result<Service, StoreError> {
    Ok(Service {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        preparation: row.try_get("preparation")?,
        price_cents: row.try_get("price_cents")?,
        active: row.try_get("active")?,
    })
}

fn slot_from_row(row: &PgRow) -> Result<Slot, StoreError> {
    Ok(Slot {
        id: row.try_get("id")?,
        service_id: row.try_get("service_id")?,
        location_id: row.try_get("location_id")?,
        location_name: row.try_get("location_name")?,
        date: parse_date(&row.try_get::<String, _>("date")?)?,
        start_time: row.try_get("start_time")?,
        capacity: row.try_get("capacity")?,
        remaining: row.try_get("remaining")?,
    })
}

fn appointment_from_row(row: &PgRow) -> Result<Appointment, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Appointment {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        slot_id: row.try_get("slot_id")?,
        service_id: row.try_get("service_id")?,
        service_name: row.try_get("service_name")?,
        user_id: row.try_get("user_id")?,
        date: parse_date(&row.try_get::<String, _>("date")?)?,
        start_time: row.try_get("start_time")?,
        location_name: row.try_get("location_name")?,
        status: AppointmentStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("appointment status {status:?}")))?,
        created_at: row.try_get("created_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
    })
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn find_open(
        &self,
        owner: &ConversationOwner,
    ) -> Result<Option<Conversation>, StoreError> {
        let (filter, key) = match owner {
            ConversationOwner::User(user_id) => ("user_id = $1", user_id),
            ConversationOwner::Session(session_id) => {
                ("session_id = $1 AND user_id IS NULL", session_id)
            }
        };
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE {filter} AND state <> 'closed' ORDER BY seq DESC LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Uniqueness comes from the partial unique indexes on open
    /// conversations; a losing insert is a no-op and the winner is re-read.
    async fn find_or_create_open(
        &self,
        owner: &ConversationOwner,
        candidate: Conversation,
    ) -> Result<Conversation, StoreError> {
        for _ in 0..3 {
            if let Some(existing) = self.find_open(owner).await? {
                return Ok(existing);
            }
            let row = sqlx::query(&format!(
                "INSERT INTO conversations (id, kind, state, session_id, user_id, operator_id, \
                     created_at, updated_at, waiting_since, transferred_at, closed_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) \
                 ON CONFLICT DO NOTHING \
                 RETURNING {CONVERSATION_COLUMNS}"
            ))
            .bind(&candidate.id)
            .bind(&candidate.kind)
            .bind(candidate.state.as_str())
            .bind(&candidate.session_id)
            .bind(owner.user_id())
            .bind(&candidate.operator_id)
            .bind(&candidate.created_at)
            .bind(&candidate.updated_at)
            .bind(&candidate.waiting_since)
            .bind(&candidate.transferred_at)
            .bind(&candidate.closed_at)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                return conversation_from_row(&row);
            }
        }
        Err(StoreError::Corrupt(format!(
            "no open conversation for {owner:?} after conflicting inserts"
        )))
    }

    async fn mark_waiting(&self, id: &str, at: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET state = 'waiting_operator', waiting_since = $1, updated_at = $1 \
             WHERE id = $2 AND state = 'active' \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn claim(
        &self,
        id: &str,
        operator_id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations \
             SET state = 'staffed', operator_id = $1, transferred_at = $2, updated_at = $2 \
             WHERE id = $3 AND state = 'waiting_operator' \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(operator_id)
        .bind(at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn close(&self, id: &str, at: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations \
             SET state = 'closed', operator_id = NULL, closed_at = $1, updated_at = $1 \
             WHERE id = $2 AND state <> 'closed' \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, conversation_id, sender, sender_id, content, sent_at, read)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.sender.as_str())
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(&message.sent_at)
        .bind(message.read)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(&message.sent_at)
            .bind(&message.conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender, sender_id, content, sent_at, read \
             FROM chat_messages WHERE conversation_id = $1 ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        reader: SenderKind,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE chat_messages SET read = TRUE \
             WHERE conversation_id = $1 AND sender <> $2 AND read = FALSE",
        )
        .bind(conversation_id)
        .bind(reader.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_waiting(&self) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE state = 'waiting_operator' ORDER BY seq ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn count_waiting_before(&self, seq: i64) -> Result<usize, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM conversations WHERE state = 'waiting_operator' AND seq < $1",
        )
        .bind(seq)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn list_for_operator(&self, operator_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE operator_id = $1 AND state = 'staffed' ORDER BY updated_at DESC"
        ))
        .bind(operator_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }
}

#[async_trait]
impl CatalogService for PgStore {
    async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, description, preparation, price_cents, active \
             FROM services WHERE active = TRUE ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(service_from_row).collect()
    }

    async fn find_service(&self, name_or_id: &str) -> Result<Option<Service>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, description, preparation, price_cents, active FROM services \
             WHERE active = TRUE AND (id = $1 OR LOWER(name) = LOWER($1)) LIMIT 1",
        )
        .bind(name_or_id.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(service_from_row).transpose()
    }

    async fn availability(
        &self,
        service_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NaiveDate>, StoreError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT date FROM slots \
             WHERE service_id = $1 AND remaining > 0 AND date >= $2 AND date <= $3 \
             ORDER BY date ASC",
        )
        .bind(service_id)
        .bind(from.to_string())
        .bind(to.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|raw| parse_date(raw)).collect()
    }

    async fn slots(&self, service_id: &str, date: NaiveDate) -> Result<Vec<Slot>, StoreError> {
        let rows = sqlx::query(
            "SELECT sl.id, sl.service_id, sl.location_id, l.name AS location_name, sl.date, \
                    sl.start_time, sl.capacity, sl.remaining \
             FROM slots sl LEFT JOIN locations l ON l.id = sl.location_id \
             WHERE sl.service_id = $1 AND sl.date = $2 AND sl.remaining > 0 \
             ORDER BY sl.start_time ASC",
        )
        .bind(service_id)
        .bind(date.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn locations(&self) -> Result<Vec<Location>, StoreError> {
        let rows = sqlx::query("SELECT id, name, address, hours FROM locations ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<Location, StoreError> {
                Ok(Location {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    address: row.try_get("address")?,
                    hours: row.try_get("hours")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AppointmentStore for PgStore {
    async fn reserve_slot_and_create(
        &self,
        slot_id: &str,
        user_id: &str,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let duplicate = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM appointments \
             WHERE slot_id = $1 AND user_id = $2 AND status = 'scheduled'",
        )
        .bind(slot_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?
            > 0;
        if duplicate {
            tx.rollback().await?;
            return Ok(ReserveOutcome::Duplicate);
        }

        let reserved = sqlx::query(
            "UPDATE slots SET remaining = remaining - 1 \
             WHERE id = $1 AND remaining > 0 \
             RETURNING service_id",
        )
        .bind(slot_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(reserved) = reserved else {
            tx.rollback().await?;
            return Ok(ReserveOutcome::CapacityExhausted);
        };
        let service_id: String = reserved.try_get("service_id")?;

        let id = uuid::Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            "INSERT INTO appointments (id, code, slot_id, service_id, user_id, status, created_at) \
             VALUES ($1,$2,$3,$4,$5,'scheduled',$6)",
        )
        .bind(&id)
        .bind(appointment_code())
        .bind(slot_id)
        .bind(&service_id)
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            // Rolling back also returns the capacity taken above.
            Err(err) if is_duplicate_booking(&err) => {
                tx.rollback().await?;
                return Ok(ReserveOutcome::Duplicate);
            }
            Err(err) => return Err(err.into()),
        }

        let row = sqlx::query(&format!("{APPOINTMENT_SELECT} WHERE a.id = $1"))
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        let appointment = appointment_from_row(&row)?;
        tx.commit().await?;
        Ok(ReserveOutcome::Booked(appointment))
    }

    async fn cancel(&self, code: &str, user_id: &str) -> Result<CancelOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, slot_id, status FROM appointments \
             WHERE UPPER(code) = UPPER($1) AND user_id = $2 FOR UPDATE",
        )
        .bind(code.trim())
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(CancelOutcome::NotFound);
        };
        let id: String = row.try_get("id")?;
        let slot_id: String = row.try_get("slot_id")?;
        let status: String = row.try_get("status")?;
        let status = AppointmentStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("appointment status {status:?}")))?;
        if status != AppointmentStatus::Scheduled {
            tx.rollback().await?;
            return Ok(CancelOutcome::AlreadyTerminal(status));
        }

        sqlx::query("UPDATE appointments SET status = 'cancelled', cancelled_at = $1 WHERE id = $2")
            .bind(Utc::now().to_rfc3339())
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE slots SET remaining = LEAST(remaining + 1, capacity) WHERE id = $1",
        )
        .bind(&slot_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!("{APPOINTMENT_SELECT} WHERE a.id = $1"))
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        let appointment = appointment_from_row(&row)?;
        tx.commit().await?;
        Ok(CancelOutcome::Cancelled(appointment))
    }

    async fn upcoming_for_user(
        &self,
        user_id: &str,
        from: NaiveDate,
    ) -> Result<Vec<Appointment>, StoreError> {
        let rows = sqlx::query(&format!(
            "{APPOINTMENT_SELECT} \
             WHERE a.user_id = $1 AND a.status = 'scheduled' AND sl.date >= $2 \
             ORDER BY sl.date ASC, sl.start_time ASC"
        ))
        .bind(user_id)
        .bind(from.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(appointment_from_row).collect()
    }
}
