use std::sync::Arc;

use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use tracing::{debug, info};

use super::machine::{
    transition, BookingCommand, BookingEvent, BookingReply, CommitOutcome, DialogueState,
    ServiceOffer, SlotOffer,
};
use crate::error::ChatError;
use crate::notify::Notifier;
use crate::store::{AppointmentStore, CatalogService};
use crate::types::{Appointment, CancelOutcome, ReserveOutcome, SystemEvent};

/// Load/commit round trips one turn may need: restart, services, dates,
/// slots, commit.
const MAX_STEPS: usize = 8;

pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Local::now().naive_local())
}

/// In-progress dialogues keyed by session id. Kept in process memory only.
#[derive(Default)]
pub struct DialogueTable {
    states: DashMap<String, DialogueState>,
}

impl DialogueTable {
    pub fn get(&self, session_id: &str) -> Option<DialogueState> {
        self.states.get(session_id).map(|entry| entry.clone())
    }

    pub fn set(&self, session_id: &str, state: DialogueState) {
        self.states.insert(session_id.to_string(), state);
    }

    pub fn clear(&self, session_id: &str) -> bool {
        self.states.remove(session_id).is_some()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.states.contains_key(session_id)
    }
}

pub struct BookingDesk {
    catalog: Arc<dyn CatalogService>,
    appointments: Arc<dyn AppointmentStore>,
    notifier: Arc<dyn Notifier>,
    dialogues: DialogueTable,
    lookahead_days: i64,
    clock: Clock,
}

impl BookingDesk {
    pub fn new(
        catalog: Arc<dyn CatalogService>,
        appointments: Arc<dyn AppointmentStore>,
        notifier: Arc<dyn Notifier>,
        lookahead_days: i64,
    ) -> Self {
        Self {
            catalog,
            appointments,
            notifier,
            dialogues: DialogueTable::default(),
            lookahead_days,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn today(&self) -> NaiveDate {
        (self.clock)().date()
    }

    pub fn in_dialogue(&self, session_id: &str) -> bool {
        self.dialogues.is_active(session_id)
    }

    pub fn dialogue(&self, session_id: &str) -> Option<DialogueState> {
        self.dialogues.get(session_id)
    }

    pub fn abandon(&self, session_id: &str) -> bool {
        self.dialogues.clear(session_id)
    }

    /// Runs one turn of the dialogue. The stored state is only replaced once
    /// a reply is produced; an error leaves it as it was.
    pub async fn handle(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        event: BookingEvent,
    ) -> Result<BookingReply, ChatError> {
        let mut state = self.dialogues.get(session_id).unwrap_or_default();
        let mut event = event;

        for _ in 0..MAX_STEPS {
            let (next, command) = transition(state, event);
            event = match command {
                BookingCommand::Reply(reply) => {
                    match next {
                        Some(next) => self.dialogues.set(session_id, next),
                        None => {
                            self.dialogues.clear(session_id);
                        }
                    }
                    debug!(session_id, step = ?reply.step, requires_auth = reply.requires_auth, "booking reply");
                    return Ok(reply);
                }
                BookingCommand::LoadServices => BookingEvent::ServicesLoaded(self.services().await?),
                BookingCommand::LoadDates { service } => {
                    let dates = self.dates(&service.id).await?;
                    BookingEvent::DatesLoaded { service, dates }
                }
                BookingCommand::LoadSlots { service, date } => {
                    let slots = self.slots(&service.id, date).await?;
                    BookingEvent::SlotsLoaded {
                        service,
                        date,
                        slots,
                    }
                }
                BookingCommand::Commit { slot } => {
                    let user_id = user_id.ok_or(ChatError::MissingIdentity)?;
                    BookingEvent::Committed(self.commit(session_id, user_id, &slot).await?)
                }
            };
            state = next.unwrap_or_default();
        }

        // Unreachable with the current transitions; fail without touching state.
        Err(ChatError::Stalled)
    }

    async fn services(&self) -> Result<Vec<ServiceOffer>, ChatError> {
        Ok(self
            .catalog
            .list_services()
            .await?
            .into_iter()
            .filter(|s| s.active)
            .map(|s| ServiceOffer {
                id: s.id,
                name: s.name,
                preparation: s.preparation,
            })
            .collect())
    }

    async fn dates(&self, service_id: &str) -> Result<Vec<NaiveDate>, ChatError> {
        let today = self.today();
        let until = today + Duration::days(self.lookahead_days);
        let mut dates = self.catalog.availability(service_id, today, until).await?;
        if dates.first() == Some(&today) && self.slots(service_id, today).await?.is_empty() {
            dates.remove(0);
        }
        Ok(dates)
    }

    /// Slots with capacity, minus the ones already started today.
    async fn slots(&self, service_id: &str, date: NaiveDate) -> Result<Vec<SlotOffer>, ChatError> {
        let now = (self.clock)();
        let cutoff = (date == now.date()).then(|| now.format("%H:%M").to_string());
        Ok(self
            .catalog
            .slots(service_id, date)
            .await?
            .into_iter()
            .filter(|slot| slot.remaining > 0)
            .filter(|slot| match &cutoff {
                Some(cutoff) => slot.start_time.as_str() > cutoff.as_str(),
                None => date > now.date(),
            })
            .map(|slot| SlotOffer {
                id: slot.id,
                start_time: slot.start_time,
                location_name: slot.location_name,
            })
            .collect())
    }

    async fn commit(
        &self,
        session_id: &str,
        user_id: &str,
        slot: &SlotOffer,
    ) -> Result<CommitOutcome, ChatError> {
        let outcome = self
            .appointments
            .reserve_slot_and_create(&slot.id, user_id)
            .await?;
        Ok(match outcome {
            ReserveOutcome::Booked(appointment) => {
                info!(session_id, user_id, slot_id = %slot.id, code = %appointment.code, "appointment booked");
                self.notifier
                    .system_broadcast(SystemEvent::AppointmentBooked {
                        code: appointment.code.clone(),
                        user_id: user_id.to_string(),
                        slot_id: slot.id.clone(),
                    })
                    .await;
                CommitOutcome::Booked {
                    code: appointment.code,
                }
            }
            ReserveOutcome::CapacityExhausted => {
                info!(session_id, slot_id = %slot.id, "slot taken before confirmation");
                CommitOutcome::CapacityExhausted
            }
            ReserveOutcome::Duplicate => CommitOutcome::Duplicate,
        })
    }

    /// Stateless cancellation by code and owner.
    pub async fn cancel_appointment(
        &self,
        code: &str,
        user_id: &str,
    ) -> Result<CancelOutcome, ChatError> {
        let code = code.trim().to_ascii_uppercase();
        let outcome = self.appointments.cancel(&code, user_id).await?;
        if let CancelOutcome::Cancelled(appointment) = &outcome {
            info!(user_id, code = %appointment.code, "appointment cancelled");
            self.notifier
                .system_broadcast(SystemEvent::AppointmentCancelled {
                    code: appointment.code.clone(),
                    user_id: user_id.to_string(),
                })
                .await;
        }
        Ok(outcome)
    }

    pub async fn upcoming(&self, user_id: &str) -> Result<Vec<Appointment>, ChatError> {
        Ok(self
            .appointments
            .upcoming_for_user(user_id, self.today())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;
    use crate::booking::machine::BookingStep;
    use crate::notify::LogNotifier;
    use crate::store::memory::fixtures::{date, service, slot};
    use crate::store::MemoryStore;
    use crate::types::AppointmentStatus;

    fn at(day: NaiveDate, hh: u32, mm: u32) -> Clock {
        let now = day.and_time(NaiveTime::from_hms_opt(hh, mm, 0).unwrap());
        Arc::new(move || now)
    }

    fn desk_over(store: Arc<MemoryStore>, clock: Clock) -> BookingDesk {
        BookingDesk::new(store.clone(), store, Arc::new(LogNotifier), 14).with_clock(clock)
    }

    /// Hemograma with a single 2025-01-10 09:00 slot of capacity 1.
    fn hemograma_store(capacity: i32) -> Arc<MemoryStore> {
        Arc::new(
            MemoryStore::new()
                .with_service(service("svc-hemo", "Hemograma"))
                .with_service(service("svc-glu", "Glucosa en ayunas"))
                .with_slot(slot("slot-0910", "svc-hemo", date(2025, 1, 10), "09:00", capacity)),
        )
    }

    fn input(text: &str, authenticated: bool) -> BookingEvent {
        BookingEvent::Input {
            text: text.to_string(),
            authenticated,
        }
    }

    async fn walk_to_confirm(desk: &BookingDesk, session_id: &str, user_id: &str) {
        let reply = desk.handle(session_id, Some(user_id), BookingEvent::Begin).await.unwrap();
        assert_eq!(reply.step, BookingStep::ChooseService);
        let reply = desk.handle(session_id, Some(user_id), input("Hemograma", true)).await.unwrap();
        assert_eq!(reply.step, BookingStep::ChooseDate);
        let reply = desk.handle(session_id, Some(user_id), input("1", true)).await.unwrap();
        assert_eq!(reply.step, BookingStep::ChooseSlot);
        let reply = desk.handle(session_id, Some(user_id), input("1", true)).await.unwrap();
        assert_eq!(reply.step, BookingStep::Confirm);
    }

    #[tokio::test]
    async fn happy_path_books_exactly_once() {
        let store = hemograma_store(3);
        let desk = desk_over(store.clone(), at(date(2025, 1, 8), 10, 0));

        walk_to_confirm(&desk, "s-1", "u-1").await;
        let reply = desk.handle("s-1", Some("u-1"), input("sí", true)).await.unwrap();

        assert_eq!(reply.step, BookingStep::Done);
        let summary = reply.summary.unwrap();
        assert_eq!(summary.service_name, "Hemograma");
        assert!(summary.code.unwrap().starts_with("LAB-"));
        assert_eq!(store.slot("slot-0910").await.unwrap().remaining, 2);
        assert_eq!(store.appointments().await.len(), 1);
        assert!(!desk.in_dialogue("s-1"));
    }

    #[tokio::test]
    async fn last_slot_race_has_one_winner() {
        let store = hemograma_store(1);
        let desk = desk_over(store.clone(), at(date(2025, 1, 8), 10, 0));
        walk_to_confirm(&desk, "s-a", "u-a").await;
        walk_to_confirm(&desk, "s-b", "u-b").await;

        let (a, b) = tokio::join!(
            desk.handle("s-a", Some("u-a"), input("sí", true)),
            desk.handle("s-b", Some("u-b"), input("sí", true)),
        );
        let replies = [a.unwrap(), b.unwrap()];
        let winners = replies.iter().filter(|r| r.step == BookingStep::Done).count();
        assert_eq!(winners, 1);
        let loser = replies.iter().find(|r| r.step != BookingStep::Done).unwrap();
        assert!(loser.text.contains("ya no está disponible"));
        assert_eq!(store.slot("slot-0910").await.unwrap().remaining, 0);
        assert!(!desk.in_dialogue("s-a") && !desk.in_dialogue("s-b"));
    }

    #[tokio::test]
    async fn anonymous_caller_resumes_after_login() {
        let store = hemograma_store(1);
        let desk = desk_over(store.clone(), at(date(2025, 1, 8), 10, 0));

        desk.handle("s-anon", None, BookingEvent::Begin).await.unwrap();
        desk.handle("s-anon", None, input("1", false)).await.unwrap();
        desk.handle("s-anon", None, input("viernes", false)).await.unwrap();
        let reply = desk.handle("s-anon", None, input("1", false)).await.unwrap();
        assert!(reply.requires_auth);
        assert!(matches!(
            desk.dialogue("s-anon"),
            Some(DialogueState::ChooseSlot { held: Some(ref held), .. }) if held.id == "slot-0910"
        ));

        let reply = desk
            .handle("s-anon", Some("u-7"), input("confirmar", true))
            .await
            .unwrap();
        assert_eq!(reply.step, BookingStep::Done);
        let booked = store.appointments().await;
        assert_eq!(booked.len(), 1);
        assert_eq!(booked[0].user_id, "u-7");
    }

    #[tokio::test]
    async fn no_availability_discards_dialogue() {
        let store = hemograma_store(1);
        // Lookahead window starts after the only slot.
        let desk = desk_over(store, at(date(2025, 1, 11), 8, 0));
        desk.handle("s-1", None, BookingEvent::Begin).await.unwrap();
        let reply = desk.handle("s-1", None, input("hemograma", false)).await.unwrap();
        assert_eq!(reply.step, BookingStep::Initial);
        assert!(reply.text.contains("no hay cupos"));
        assert!(!desk.in_dialogue("s-1"));
    }

    #[tokio::test]
    async fn slots_already_started_today_are_hidden() {
        let store = Arc::new(
            MemoryStore::new()
                .with_service(service("svc-hemo", "Hemograma"))
                .with_slot(slot("early", "svc-hemo", date(2025, 1, 10), "07:00", 2))
                .with_slot(slot("late", "svc-hemo", date(2025, 1, 10), "11:00", 2)),
        );
        let desk = desk_over(store, at(date(2025, 1, 10), 9, 30));
        desk.handle("s-1", None, BookingEvent::Begin).await.unwrap();
        desk.handle("s-1", None, input("1", false)).await.unwrap();
        desk.handle("s-1", None, input("1", false)).await.unwrap();
        match desk.dialogue("s-1") {
            Some(DialogueState::ChooseSlot { slots, .. }) => {
                assert_eq!(slots.len(), 1);
                assert_eq!(slots[0].id, "late");
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_restores_capacity_and_second_cancel_reports_terminal() {
        let store = hemograma_store(2);
        let desk = desk_over(store.clone(), at(date(2025, 1, 8), 10, 0));
        walk_to_confirm(&desk, "s-1", "u-1").await;
        let code = desk
            .handle("s-1", Some("u-1"), input("si", true))
            .await
            .unwrap()
            .summary
            .and_then(|s| s.code)
            .unwrap();
        assert_eq!(store.slot("slot-0910").await.unwrap().remaining, 1);

        let first = desk.cancel_appointment(&code.to_lowercase(), "u-1").await.unwrap();
        assert!(matches!(first, CancelOutcome::Cancelled(_)));
        assert_eq!(store.slot("slot-0910").await.unwrap().remaining, 2);

        let second = desk.cancel_appointment(&code, "u-1").await.unwrap();
        assert!(matches!(
            second,
            CancelOutcome::AlreadyTerminal(AppointmentStatus::Cancelled)
        ));
        assert_eq!(store.slot("slot-0910").await.unwrap().remaining, 2);
    }

    #[tokio::test]
    async fn invalid_input_keeps_stored_state() {
        let store = hemograma_store(1);
        let desk = desk_over(store, at(date(2025, 1, 8), 10, 0));
        desk.handle("s-1", None, BookingEvent::Begin).await.unwrap();
        let before = desk.dialogue("s-1");
        let reply = desk.handle("s-1", None, input("tomografía", false)).await.unwrap();
        assert_eq!(reply.step, BookingStep::ChooseService);
        assert_eq!(desk.dialogue("s-1"), before);
    }
}
