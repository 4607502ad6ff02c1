use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use tokio::sync::Mutex;

use super::{appointment_code, AppointmentStore, CatalogService, ConversationStore};
use crate::error::StoreError;
use crate::types::{
    Appointment, AppointmentStatus, CancelOutcome, ChatMessage, Conversation, ConversationOwner,
    ConversationState, Location, ReserveOutcome, SenderKind, Service, Slot,
};

#[derive(Default)]
struct MemoryInner {
    next_seq: i64,
    conversations: HashMap<String, Conversation>,
    messages: Vec<ChatMessage>,
    services: Vec<Service>,
    locations: Vec<Location>,
    slots: Vec<Slot>,
    appointments: Vec<Appointment>,
}

/// Everything behind one lock, so each operation is trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.inner.get_mut().services.push(service);
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.inner.get_mut().locations.push(location);
        self
    }

    pub fn with_slot(mut self, slot: Slot) -> Self {
        self.inner.get_mut().slots.push(slot);
        self
    }

    /// A small catalog for running without Postgres: three exams with
    /// morning slots on the weekdays after `today`.
    pub fn demo(today: NaiveDate) -> Self {
        let mut store = Self::new()
            .with_location(Location {
                id: "loc-centro".to_string(),
                name: "Sede Centro".to_string(),
                address: "Av. Principal 123".to_string(),
                hours: "L-V 7:00-18:00, S 7:00-12:00".to_string(),
            })
            .with_location(Location {
                id: "loc-norte".to_string(),
                name: "Sede Norte".to_string(),
                address: "Calle 45 #10-20".to_string(),
                hours: "L-V 7:00-16:00".to_string(),
            });
        let services = [
            ("svc-hemograma", "Hemograma", 1_500_000, "No requiere ayuno."),
            ("svc-glucosa", "Glucosa en ayunas", 900_000, "Ayuno de 8 horas."),
            ("svc-lipidos", "Perfil lipídico", 2_800_000, "Ayuno de 12 horas."),
        ];
        for (id, name, price_cents, preparation) in services {
            store = store.with_service(Service {
                id: id.to_string(),
                name: name.to_string(),
                description: String::new(),
                preparation: preparation.to_string(),
                price_cents,
                active: true,
            });
        }
        for offset in 1..=10 {
            let date = today + Duration::days(offset);
            if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                continue;
            }
            for (id, _, _, _) in services {
                for time in ["07:00", "07:30", "08:00", "09:00"] {
                    store = store.with_slot(Slot {
                        id: format!("{id}-{date}-{time}"),
                        service_id: id.to_string(),
                        location_id: Some("loc-centro".to_string()),
                        location_name: Some("Sede Centro".to_string()),
                        date,
                        start_time: time.to_string(),
                        capacity: 3,
                        remaining: 3,
                    });
                }
            }
        }
        store
    }

    pub async fn slot(&self, slot_id: &str) -> Option<Slot> {
        let inner = self.inner.lock().await;
        inner.slots.iter().find(|slot| slot.id == slot_id).cloned()
    }

    pub async fn appointments(&self) -> Vec<Appointment> {
        self.inner.lock().await.appointments.clone()
    }
}

fn open_for(inner: &MemoryInner, owner: &ConversationOwner) -> Option<Conversation> {
    inner
        .conversations
        .values()
        .filter(|c| c.state != ConversationState::Closed)
        .filter(|c| match owner {
            ConversationOwner::User(user_id) => c.user_id.as_deref() == Some(user_id.as_str()),
            ConversationOwner::Session(session_id) => {
                c.user_id.is_none() && &c.session_id == session_id
            }
        })
        .max_by_key(|c| c.seq)
        .cloned()
}

fn touch(conversation: &mut Conversation, at: &str) {
    conversation.updated_at = at.to_string();
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.inner.lock().await.conversations.get(id).cloned())
    }

    async fn find_open(
        &self,
        owner: &ConversationOwner,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(open_for(&*self.inner.lock().await, owner))
    }

    async fn find_or_create_open(
        &self,
        owner: &ConversationOwner,
        mut candidate: Conversation,
    ) -> Result<Conversation, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = open_for(&inner, owner) {
            return Ok(existing);
        }
        inner.next_seq += 1;
        candidate.seq = inner.next_seq;
        candidate.user_id = owner.user_id().map(str::to_string);
        inner
            .conversations
            .insert(candidate.id.clone(), candidate.clone());
        Ok(candidate)
    }

    async fn mark_waiting(&self, id: &str, at: &str) -> Result<Option<Conversation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(conversation) = inner.conversations.get_mut(id) else {
            return Ok(None);
        };
        if conversation.state != ConversationState::Active {
            return Ok(None);
        }
        conversation.state = ConversationState::WaitingOperator;
        conversation.waiting_since = Some(at.to_string());
        touch(conversation, at);
        Ok(Some(conversation.clone()))
    }

    async fn claim(
        &self,
        id: &str,
        operator_id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(conversation) = inner.conversations.get_mut(id) else {
            return Ok(None);
        };
        if conversation.state != ConversationState::WaitingOperator {
            return Ok(None);
        }
        conversation.state = ConversationState::Staffed;
        conversation.operator_id = Some(operator_id.to_string());
        conversation.transferred_at = Some(at.to_string());
        touch(conversation, at);
        Ok(Some(conversation.clone()))
    }

    async fn close(&self, id: &str, at: &str) -> Result<Option<Conversation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(conversation) = inner.conversations.get_mut(id) else {
            return Ok(None);
        };
        if conversation.state == ConversationState::Closed {
            return Ok(None);
        }
        conversation.state = ConversationState::Closed;
        conversation.operator_id = None;
        conversation.closed_at = Some(at.to_string());
        touch(conversation, at);
        Ok(Some(conversation.clone()))
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(conversation) = inner.conversations.get_mut(&message.conversation_id) {
            touch(conversation, &message.sent_at);
        }
        inner.messages.push(message.clone());
        Ok(())
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        reader: SenderKind,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut changed = 0;
        for message in inner
            .messages
            .iter_mut()
            .filter(|m| m.conversation_id == conversation_id && m.sender != reader && !m.read)
        {
            message.read = true;
            changed += 1;
        }
        Ok(changed)
    }

    async fn list_waiting(&self) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.inner.lock().await;
        let mut waiting = inner
            .conversations
            .values()
            .filter(|c| c.state == ConversationState::WaitingOperator)
            .cloned()
            .collect::<Vec<_>>();
        waiting.sort_by_key(|c| c.seq);
        Ok(waiting)
    }

    async fn count_waiting_before(&self, seq: i64) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .conversations
            .values()
            .filter(|c| c.state == ConversationState::WaitingOperator && c.seq < seq)
            .count())
    }

    async fn list_for_operator(&self, operator_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.inner.lock().await;
        let mut mine = inner
            .conversations
            .values()
            .filter(|c| {
                c.state == ConversationState::Staffed && c.operator_id.as_deref() == Some(operator_id)
            })
            .cloned()
            .collect::<Vec<_>>();
        mine.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(mine)
    }
}

#[async_trait]
impl CatalogService for MemoryStore {
    async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.services.iter().filter(|s| s.active).cloned().collect())
    }

    async fn find_service(&self, name_or_id: &str) -> Result<Option<Service>, StoreError> {
        let needle = name_or_id.trim().to_lowercase();
        let inner = self.inner.lock().await;
        Ok(inner
            .services
            .iter()
            .find(|s| s.active && (s.id == name_or_id || s.name.to_lowercase() == needle))
            .cloned())
    }

    async fn availability(
        &self,
        service_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NaiveDate>, StoreError> {
        let inner = self.inner.lock().await;
        let mut dates = inner
            .slots
            .iter()
            .filter(|s| s.service_id == service_id && s.remaining > 0)
            .filter(|s| s.date >= from && s.date <= to)
            .map(|s| s.date)
            .collect::<Vec<_>>();
        dates.sort();
        dates.dedup();
        Ok(dates)
    }

    async fn slots(&self, service_id: &str, date: NaiveDate) -> Result<Vec<Slot>, StoreError> {
        let inner = self.inner.lock().await;
        let mut slots = inner
            .slots
            .iter()
            .filter(|s| s.service_id == service_id && s.date == date && s.remaining > 0)
            .cloned()
            .collect::<Vec<_>>();
        slots.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(slots)
    }

    async fn locations(&self) -> Result<Vec<Location>, StoreError> {
        Ok(self.inner.lock().await.locations.clone())
    }
}

#[async_trait]
impl AppointmentStore for MemoryStore {
    async fn reserve_slot_and_create(
        &self,
        slot_id: &str,
        user_id: &str,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner.appointments.iter().any(|a| {
            a.slot_id == slot_id && a.user_id == user_id && a.status == AppointmentStatus::Scheduled
        });
        if duplicate {
            return Ok(ReserveOutcome::Duplicate);
        }

        let Some(slot) = inner
            .slots
            .iter_mut()
            .find(|s| s.id == slot_id && s.remaining > 0)
        else {
            return Ok(ReserveOutcome::CapacityExhausted);
        };
        slot.remaining -= 1;
        let slot = slot.clone();

        let service_name = inner
            .services
            .iter()
            .find(|s| s.id == slot.service_id)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let appointment = Appointment {
            id: uuid::Uuid::new_v4().to_string(),
            code: appointment_code(),
            slot_id: slot.id.clone(),
            service_id: slot.service_id.clone(),
            service_name,
            user_id: user_id.to_string(),
            date: slot.date,
            start_time: slot.start_time.clone(),
            location_name: slot.location_name.clone(),
            status: AppointmentStatus::Scheduled,
            created_at: Utc::now().to_rfc3339(),
            cancelled_at: None,
        };
        inner.appointments.push(appointment.clone());
        Ok(ReserveOutcome::Booked(appointment))
    }

    async fn cancel(&self, code: &str, user_id: &str) -> Result<CancelOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(appointment) = inner
            .appointments
            .iter_mut()
            .find(|a| a.code.eq_ignore_ascii_case(code) && a.user_id == user_id)
        else {
            return Ok(CancelOutcome::NotFound);
        };
        if appointment.status != AppointmentStatus::Scheduled {
            return Ok(CancelOutcome::AlreadyTerminal(appointment.status));
        }
        appointment.status = AppointmentStatus::Cancelled;
        appointment.cancelled_at = Some(Utc::now().to_rfc3339());
        let cancelled = appointment.clone();
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == cancelled.slot_id) {
            slot.remaining += 1;
        }
        Ok(CancelOutcome::Cancelled(cancelled))
    }

    async fn upcoming_for_user(
        &self,
        user_id: &str,
        from: NaiveDate,
    ) -> Result<Vec<Appointment>, StoreError> {
        let inner = self.inner.lock().await;
        let mut upcoming = inner
            .appointments
            .iter()
            .filter(|a| {
                a.user_id == user_id && a.status == AppointmentStatus::Scheduled && a.date >= from
            })
            .cloned()
            .collect::<Vec<_>>();
        upcoming.sort_by(|a, b| (a.date, &a.start_time).cmp(&(b.date, &b.start_time)));
        Ok(upcoming)
    }
}
