//! Booking dialogue as a pure transition function.
//!
//! `transition(state, event)` never performs I/O. When it needs data it
//! answers with a `Load*` command and expects the caller to feed back the
//! matching `*Loaded` event; when it needs a reservation it answers with
//! `Commit` and expects `Committed`. Every path ends in `Reply`.

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::prompting::{render_booking_confirmed, render_options};
use crate::text::{
    format_date_es, is_affirmative, is_negative, normalize, parse_ordinal, weekday_from_es,
};
use crate::types::BookingSummary;

const FUZZY_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceOffer {
    pub id: String,
    pub name: String,
    pub preparation: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotOffer {
    pub id: String,
    pub start_time: String,
    pub location_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum DialogueState {
    #[default]
    Initial,
    ChooseService {
        offers: Vec<ServiceOffer>,
    },
    ChooseDate {
        service: ServiceOffer,
        dates: Vec<NaiveDate>,
    },
    ChooseSlot {
        service: ServiceOffer,
        date: NaiveDate,
        slots: Vec<SlotOffer>,
        /// Slot picked by a caller who still has to log in.
        held: Option<SlotOffer>,
    },
    Confirm {
        service: ServiceOffer,
        date: NaiveDate,
        slot: SlotOffer,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStep {
    Initial,
    ChooseService,
    ChooseDate,
    ChooseSlot,
    Confirm,
    Done,
}

impl DialogueState {
    pub fn step(&self) -> BookingStep {
        match self {
            Self::Initial => BookingStep::Initial,
            Self::ChooseService { .. } => BookingStep::ChooseService,
            Self::ChooseDate { .. } => BookingStep::ChooseDate,
            Self::ChooseSlot { .. } => BookingStep::ChooseSlot,
            Self::Confirm { .. } => BookingStep::Confirm,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Booked { code: String },
    CapacityExhausted,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookingEvent {
    Begin,
    ServicesLoaded(Vec<ServiceOffer>),
    DatesLoaded {
        service: ServiceOffer,
        dates: Vec<NaiveDate>,
    },
    SlotsLoaded {
        service: ServiceOffer,
        date: NaiveDate,
        slots: Vec<SlotOffer>,
    },
    Input {
        text: String,
        authenticated: bool,
    },
    Committed(CommitOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookingReply {
    pub text: String,
    pub step: BookingStep,
    pub requires_auth: bool,
    pub summary: Option<BookingSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookingCommand {
    LoadServices,
    LoadDates { service: ServiceOffer },
    LoadSlots { service: ServiceOffer, date: NaiveDate },
    Commit { slot: SlotOffer },
    Reply(BookingReply),
}

pub type Transition = (Option<DialogueState>, BookingCommand);

fn reply(text: impl Into<String>, step: BookingStep) -> BookingCommand {
    BookingCommand::Reply(BookingReply {
        text: text.into(),
        step,
        requires_auth: false,
        summary: None,
    })
}

/// Reply that keeps the dialogue in `state`.
fn stay(state: DialogueState, text: String) -> Transition {
    let step = state.step();
    (Some(state), reply(text, step))
}

fn discard(text: impl Into<String>) -> Transition {
    (None, reply(text, BookingStep::Initial))
}

fn summary(service: &ServiceOffer, date: NaiveDate, slot: &SlotOffer) -> BookingSummary {
    BookingSummary {
        service_name: service.name.clone(),
        date,
        start_time: slot.start_time.clone(),
        location_name: slot.location_name.clone(),
        code: None,
    }
}

fn slot_label(slot: &SlotOffer) -> String {
    match &slot.location_name {
        Some(location) => format!("{} ({location})", slot.start_time),
        None => slot.start_time.clone(),
    }
}

fn services_prompt(offers: &[ServiceOffer]) -> String {
    let names = offers.iter().map(|o| o.name.clone()).collect::<Vec<_>>();
    render_options(
        "¿Qué examen deseas agendar?",
        &names,
        "Responde con el número o el nombre del examen. Escribe \"cancelar\" para salir.",
    )
}

fn dates_prompt(service: &ServiceOffer, dates: &[NaiveDate]) -> String {
    let labels = dates.iter().map(|d| format_date_es(*d)).collect::<Vec<_>>();
    render_options(
        &format!("Fechas disponibles para {}:", service.name),
        &labels,
        "Responde con el número o el día de la semana.",
    )
}

fn slots_prompt(date: NaiveDate, slots: &[SlotOffer]) -> String {
    let labels = slots.iter().map(slot_label).collect::<Vec<_>>();
    render_options(
        &format!("Horarios disponibles para el {}:", format_date_es(date)),
        &labels,
        "Responde con el número del horario.",
    )
}

fn confirm_prompt(service: &ServiceOffer, date: NaiveDate, slot: &SlotOffer) -> String {
    let location = slot
        .location_name
        .as_ref()
        .map(|l| format!(" en {l}"))
        .unwrap_or_default();
    format!(
        "Vas a agendar {} el {} a las {}{}. ¿Confirmas? (sí/no)",
        service.name,
        format_date_es(date),
        slot.start_time,
        location
    )
}

fn auth_required(service: &ServiceOffer, date: NaiveDate, slot: SlotOffer, slots: Vec<SlotOffer>) -> Transition {
    let text = format!(
        "Para confirmar tu cita de {} el {} a las {} necesitas iniciar sesión. \
         Cuando lo hayas hecho, responde \"confirmar\".",
        service.name,
        format_date_es(date),
        slot.start_time
    );
    let state = DialogueState::ChooseSlot {
        service: service.clone(),
        date,
        slots,
        held: Some(slot),
    };
    (
        Some(state),
        BookingCommand::Reply(BookingReply {
            text,
            step: BookingStep::ChooseSlot,
            requires_auth: true,
            summary: None,
        }),
    )
}

fn is_abort(text: &str) -> bool {
    matches!(
        text,
        "cancelar" | "salir" | "cancelar reserva" | "cancelar agendamiento" | "ya no" | "olvidalo"
    )
}

fn is_restart(text: &str) -> bool {
    matches!(
        text,
        "reiniciar" | "empezar de nuevo" | "volver a empezar" | "comenzar de nuevo"
    )
}

pub fn match_service<'a>(input: &str, offers: &'a [ServiceOffer]) -> Option<&'a ServiceOffer> {
    if let Some(n) = parse_ordinal(input) {
        return offers.get(n - 1);
    }
    let needle = normalize(input);
    if needle.len() < 3 {
        return None;
    }
    if let Some(exact) = offers.iter().find(|o| normalize(&o.name) == needle) {
        return Some(exact);
    }
    let containing = offers
        .iter()
        .filter(|o| {
            let name = normalize(&o.name);
            name.contains(&needle) || needle.contains(&name)
        })
        .collect::<Vec<_>>();
    if let [only] = containing.as_slice() {
        return Some(only);
    }
    offers
        .iter()
        .map(|o| (o, strsim::jaro_winkler(&needle, &normalize(&o.name))))
        .filter(|(_, score)| *score >= FUZZY_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(o, _)| o)
}

pub fn match_date(input: &str, dates: &[NaiveDate]) -> Option<NaiveDate> {
    if let Some(n) = parse_ordinal(input) {
        return dates.get(n - 1).copied();
    }
    let text = normalize(input);
    if let Some(weekday) = text.split_whitespace().find_map(weekday_from_es) {
        return dates.iter().find(|d| d.weekday() == weekday).copied();
    }
    if let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        return dates.iter().find(|d| **d == date).copied();
    }
    let parts = text
        .split(['/', '-'])
        .map(|p| p.trim().parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()?;
    match parts.as_slice() {
        [day, month] | [day, month, _] => dates
            .iter()
            .find(|d| d.day() == *day && d.month() == *month)
            .copied(),
        _ => None,
    }
}

fn normalize_time(raw: &str) -> Option<String> {
    let (hour, minute) = raw.split_once(':')?;
    let hour = hour.trim().parse::<u32>().ok().filter(|h| *h < 24)?;
    let minute = minute.trim().parse::<u32>().ok().filter(|m| *m < 60)?;
    Some(format!("{hour:02}:{minute:02}"))
}

pub fn match_slot<'a>(input: &str, slots: &'a [SlotOffer]) -> Option<&'a SlotOffer> {
    let trimmed = input.trim();
    if trimmed.contains(':') {
        let wanted = normalize_time(trimmed)?;
        return slots.iter().find(|s| s.start_time == wanted);
    }
    parse_ordinal(trimmed).and_then(|n| slots.get(n - 1))
}

pub fn transition(state: DialogueState, event: BookingEvent) -> Transition {
    match event {
        BookingEvent::Begin => (Some(DialogueState::Initial), BookingCommand::LoadServices),
        BookingEvent::ServicesLoaded(offers) => {
            if offers.is_empty() {
                return discard(
                    "En este momento no hay exámenes disponibles para agendar en línea. \
                     ¿Te puedo ayudar con algo más?",
                );
            }
            let text = services_prompt(&offers);
            (
                Some(DialogueState::ChooseService { offers }),
                reply(text, BookingStep::ChooseService),
            )
        }
        BookingEvent::DatesLoaded { service, dates } => {
            if dates.is_empty() {
                return discard(format!(
                    "Lo siento, no hay cupos disponibles para {} en los próximos días. \
                     ¿Te puedo ayudar con algo más?",
                    service.name
                ));
            }
            let text = dates_prompt(&service, &dates);
            (
                Some(DialogueState::ChooseDate { service, dates }),
                reply(text, BookingStep::ChooseDate),
            )
        }
        BookingEvent::SlotsLoaded {
            service,
            date,
            slots,
        } => {
            if slots.is_empty() {
                let remaining = match state {
                    DialogueState::ChooseDate { dates, .. } => {
                        dates.into_iter().filter(|d| *d != date).collect::<Vec<_>>()
                    }
                    _ => Vec::new(),
                };
                if remaining.is_empty() {
                    return discard(format!(
                        "Lo siento, ya no quedan horarios para {}. ¿Te puedo ayudar con algo más?",
                        service.name
                    ));
                }
                let text = format!(
                    "Ya no quedan horarios para el {}.\n{}",
                    format_date_es(date),
                    dates_prompt(&service, &remaining)
                );
                return stay(
                    DialogueState::ChooseDate {
                        service,
                        dates: remaining,
                    },
                    text,
                );
            }
            let text = slots_prompt(date, &slots);
            (
                Some(DialogueState::ChooseSlot {
                    service,
                    date,
                    slots,
                    held: None,
                }),
                reply(text, BookingStep::ChooseSlot),
            )
        }
        BookingEvent::Input {
            text,
            authenticated,
        } => on_input(state, &text, authenticated),
        BookingEvent::Committed(outcome) => on_committed(state, outcome),
    }
}

fn on_input(state: DialogueState, raw: &str, authenticated: bool) -> Transition {
    let text = normalize(raw);
    if state != DialogueState::Initial {
        if is_abort(&text) {
            return discard("Listo, cancelé el proceso de agendamiento. ¿Te ayudo con algo más?");
        }
        if is_restart(&text) {
            return (Some(DialogueState::Initial), BookingCommand::LoadServices);
        }
    }

    match state {
        DialogueState::Initial => (Some(DialogueState::Initial), BookingCommand::LoadServices),
        DialogueState::ChooseService { offers } => match match_service(raw, &offers) {
            Some(service) => {
                let service = service.clone();
                (
                    Some(DialogueState::ChooseService { offers }),
                    BookingCommand::LoadDates { service },
                )
            }
            None => {
                let text = format!("No reconocí ese examen.\n{}", services_prompt(&offers));
                stay(DialogueState::ChooseService { offers }, text)
            }
        },
        DialogueState::ChooseDate { service, dates } => match match_date(raw, &dates) {
            Some(date) => {
                let command = BookingCommand::LoadSlots {
                    service: service.clone(),
                    date,
                };
                (Some(DialogueState::ChooseDate { service, dates }), command)
            }
            None => {
                let text = format!(
                    "No reconocí esa fecha.\n{}",
                    dates_prompt(&service, &dates)
                );
                stay(DialogueState::ChooseDate { service, dates }, text)
            }
        },
        DialogueState::ChooseSlot {
            service,
            date,
            slots,
            held,
        } => {
            if let (Some(slot), true) = (held.as_ref(), is_affirmative(raw)) {
                if !authenticated {
                    let slot = slot.clone();
                    return auth_required(&service, date, slot, slots);
                }
                let slot = slot.clone();
                return (
                    Some(DialogueState::Confirm {
                        service,
                        date,
                        slot: slot.clone(),
                    }),
                    BookingCommand::Commit { slot },
                );
            }
            match match_slot(raw, &slots).cloned() {
                Some(slot) if !authenticated => auth_required(&service, date, slot, slots),
                Some(slot) => {
                    let text = confirm_prompt(&service, date, &slot);
                    stay(
                        DialogueState::Confirm {
                            service,
                            date,
                            slot,
                        },
                        text,
                    )
                }
                None => {
                    let text = format!("No reconocí ese horario.\n{}", slots_prompt(date, &slots));
                    stay(
                        DialogueState::ChooseSlot {
                            service,
                            date,
                            slots,
                            held,
                        },
                        text,
                    )
                }
            }
        }
        DialogueState::Confirm {
            service,
            date,
            slot,
        } => {
            if is_affirmative(raw) {
                if !authenticated {
                    return auth_required(&service, date, slot.clone(), vec![slot]);
                }
                let command = BookingCommand::Commit { slot: slot.clone() };
                return (
                    Some(DialogueState::Confirm {
                        service,
                        date,
                        slot,
                    }),
                    command,
                );
            }
            if is_negative(raw) {
                return discard("Entendido, no agendé la cita. ¿Te ayudo con algo más?");
            }
            let text = format!(
                "Por favor responde \"sí\" para confirmar o \"no\" para cancelar.\n{}",
                confirm_prompt(&service, date, &slot)
            );
            stay(
                DialogueState::Confirm {
                    service,
                    date,
                    slot,
                },
                text,
            )
        }
    }
}

fn on_committed(state: DialogueState, outcome: CommitOutcome) -> Transition {
    let DialogueState::Confirm {
        service,
        date,
        slot,
    } = state
    else {
        return discard("No encontré una reserva pendiente. Escribe \"agendar cita\" para empezar.");
    };
    match outcome {
        CommitOutcome::Booked { code } => {
            let mut booked = summary(&service, date, &slot);
            booked.code = Some(code);
            let text = render_booking_confirmed(&booked, &service.preparation);
            (
                None,
                BookingCommand::Reply(BookingReply {
                    text,
                    step: BookingStep::Done,
                    requires_auth: false,
                    summary: Some(booked),
                }),
            )
        }
        CommitOutcome::CapacityExhausted => discard(format!(
            "Lo siento, el horario de las {} ya no está disponible: otra persona lo reservó \
             antes de tu confirmación. Escribe \"agendar cita\" para elegir otro.",
            slot.start_time
        )),
        CommitOutcome::Duplicate => discard(format!(
            "Ya tienes una cita de {} agendada en ese horario.",
            service.name
        )),
    }
}
