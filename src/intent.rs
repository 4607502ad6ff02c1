//! Turn resolution for the bot side of a conversation.
//!
//! A configured NLU provider is asked first; its confidence gates whether we
//! trust it at all. Without a provider, or when it fails, the local table
//! below is scanned in declaration order and the first matching pattern
//! wins. Booking intents hand the session over to the booking desk, which
//! then owns every turn until the dialogue ends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use futures_util::future::BoxFuture;
use regex::Regex;
use tracing::{debug, warn};

use crate::booking::{BookingDesk, BookingEvent, BookingReply};
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::handoff::HandoffCoordinator;
use crate::nlu::{NluProvider, NluResult};
use crate::prompting::render_appointments;
use crate::store::CatalogService;
use crate::text::{format_price, normalize};
use crate::types::{
    AppointmentStatus, BookingSummary, CancelOutcome, HandoffTicket, NluParameters, Service,
    TurnSource,
};

const LOCAL_FALLBACKS: &[&str] = &[
    "No estoy seguro de haberte entendido. Puedo ayudarte a agendar o cancelar citas, consultar precios, preparación, horarios y sedes.",
    "Disculpa, no entendí tu mensaje. Prueba con algo como \"agendar cita\", \"precio del hemograma\" o \"horarios\".",
    "Perdón, eso no lo reconozco. Si prefieres hablar con una persona, escribe \"operador\".",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    BookAppointment,
    CancelAppointment,
    MyAppointments,
    ExamPrice,
    ExamPreparation,
    OpeningHours,
    Locations,
    ResultsInfo,
    HumanHandoff,
    Thanks,
    Goodbye,
}

impl Intent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::BookAppointment => "appointment.book",
            Self::CancelAppointment => "appointment.cancel",
            Self::MyAppointments => "appointment.list",
            Self::ExamPrice => "exam.price",
            Self::ExamPreparation => "exam.preparation",
            Self::OpeningHours => "lab.hours",
            Self::Locations => "lab.locations",
            Self::ResultsInfo => "results.info",
            Self::HumanHandoff => "handoff.request",
            Self::Thanks => "thanks",
            Self::Goodbye => "goodbye",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "greeting" => Some(Self::Greeting),
            "appointment.book" => Some(Self::BookAppointment),
            "appointment.cancel" => Some(Self::CancelAppointment),
            "appointment.list" => Some(Self::MyAppointments),
            "exam.price" => Some(Self::ExamPrice),
            "exam.preparation" => Some(Self::ExamPreparation),
            "lab.hours" => Some(Self::OpeningHours),
            "lab.locations" => Some(Self::Locations),
            "results.info" => Some(Self::ResultsInfo),
            "handoff.request" => Some(Self::HumanHandoff),
            "thanks" => Some(Self::Thanks),
            "goodbye" => Some(Self::Goodbye),
            _ => None,
        }
    }

    /// Intents whose answer comes from live data rather than fixed copy.
    fn needs_lookup(&self) -> bool {
        matches!(
            self,
            Self::BookAppointment
                | Self::CancelAppointment
                | Self::MyAppointments
                | Self::ExamPrice
                | Self::ExamPreparation
                | Self::OpeningHours
                | Self::Locations
                | Self::HumanHandoff
        )
    }
}

pub struct IntentContext<'a> {
    pub engine: &'a IntentEngine,
    pub session_id: &'a str,
    pub user_id: Option<&'a str>,
    pub text: &'a str,
    /// Exam name or appointment code extracted by the NLU provider.
    pub entity: Option<&'a str>,
}

#[derive(Debug)]
pub enum IntentOutcome {
    Reply { text: String, requires_auth: bool },
    StartBooking,
    Handoff { text: String, ticket: HandoffTicket },
}

impl IntentOutcome {
    fn text(text: impl Into<String>) -> Self {
        Self::Reply {
            text: text.into(),
            requires_auth: false,
        }
    }

    fn login(text: impl Into<String>) -> Self {
        Self::Reply {
            text: text.into(),
            requires_auth: true,
        }
    }
}

type HandlerResult = Result<IntentOutcome, ChatError>;
pub type IntentHandler = for<'a> fn(IntentContext<'a>) -> BoxFuture<'a, HandlerResult>;

pub struct IntentPattern {
    pub intent: Intent,
    pub matchers: Vec<Regex>,
    pub handler: IntentHandler,
}

fn pattern(intent: Intent, patterns: &[&str], handler: IntentHandler) -> IntentPattern {
    IntentPattern {
        intent,
        matchers: patterns
            .iter()
            .map(|p| Regex::new(p).unwrap_or_else(|err| panic!("intent pattern {p:?}: {err}")))
            .collect(),
        handler,
    }
}

static INTENT_TABLE: LazyLock<Vec<IntentPattern>> = LazyLock::new(intent_table);

static APPOINTMENT_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\blab-?([0-9a-z]{6})\b").expect("appointment code pattern"));

/// Matchers run against `text::normalize` output: lowercase, no accents,
/// no punctuation. Order matters.
fn intent_table() -> Vec<IntentPattern> {
    vec![
        pattern(
            Intent::HumanHandoff,
            &[
                r"\b(operador|operadora|asesor|asesora|agente|humano)\b",
                r"\bhablar con (alguien|una persona|una asesora?)\b",
                r"\bpersona real\b",
            ],
            request_handoff,
        ),
        pattern(
            Intent::CancelAppointment,
            &[r"\b(cancelar|cancela|anular)\b.*\b(cita|turno|reserva)\b", r"\b(cancelar|anular)\b.*\blab-?[0-9a-z]{6}\b"],
            cancel_appointment,
        ),
        pattern(
            Intent::MyAppointments,
            &[
                r"\bmis (citas|turnos|reservas)\b",
                r"\b(ver|consultar) (mis )?citas\b",
                r"\bcitas? (agendadas|programadas|pendientes)\b",
            ],
            my_appointments,
        ),
        pattern(
            Intent::BookAppointment,
            &[
                r"\b(agendar|reservar|programar|sacar|pedir|separar)\b.*\b(cita|turno|examen|hora)\b",
                r"\bquiero (una )?cita\b",
                r"\bnueva cita\b",
                r"^(agendar|reservar)$",
            ],
            start_booking,
        ),
        pattern(
            Intent::ExamPrice,
            &[r"\b(precio|precios|costo|costos|valor|tarifa|tarifas)\b", r"\bcuanto (cuesta|vale|sale|cobran)\b"],
            exam_price,
        ),
        pattern(
            Intent::ExamPreparation,
            &[r"\b(preparacion|prepararme|preparo|ayuno|ayunas|requisitos|indicaciones)\b"],
            exam_preparation,
        ),
        pattern(
            Intent::OpeningHours,
            &[r"\b(horario|horarios|abren|cierran|atienden)\b", r"\ba que hora\b"],
            opening_hours,
        ),
        pattern(
            Intent::Locations,
            &[
                r"\b(sede|sedes|direccion|ubicacion|ubicados|sucursal|sucursales)\b",
                r"\bdonde (quedan|estan|queda)\b",
            ],
            locations,
        ),
        pattern(Intent::ResultsInfo, &[r"\b(resultado|resultados)\b"], results_info),
        pattern(
            Intent::Greeting,
            &[r"^(hola|holi|buenas|buenos dias|buenas tardes|buenas noches|saludos|hey|que tal)\b"],
            greeting,
        ),
        pattern(Intent::Thanks, &[r"\b(gracias|te agradezco|muy amable)\b"], thanks),
        pattern(
            Intent::Goodbye,
            &[r"\b(adios|chao|chau|hasta luego|hasta pronto|nos vemos|bye)\b"],
            goodbye,
        ),
    ]
}

/// What the engine answered for one bot turn.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub text: String,
    pub source: TurnSource,
    pub intent: Option<String>,
    pub confidence: Option<f64>,
    pub requires_auth: bool,
    pub booking_summary: Option<BookingSummary>,
    pub handoff: Option<HandoffTicket>,
}

impl Resolution {
    fn plain(text: impl Into<String>, source: TurnSource) -> Self {
        Self {
            text: text.into(),
            source,
            intent: None,
            confidence: None,
            requires_auth: false,
            booking_summary: None,
            handoff: None,
        }
    }

    fn from_booking(reply: BookingReply, source: TurnSource) -> Self {
        Self {
            text: reply.text,
            source,
            intent: Some(Intent::BookAppointment.label().to_string()),
            confidence: None,
            requires_auth: reply.requires_auth,
            booking_summary: reply.summary,
            handoff: None,
        }
    }
}

pub struct IntentEngine {
    nlu: Option<Arc<dyn NluProvider>>,
    catalog: Arc<dyn CatalogService>,
    booking: Arc<BookingDesk>,
    handoff: Arc<HandoffCoordinator>,
    config: ChatConfig,
    fallback_cursor: AtomicUsize,
}

impl IntentEngine {
    pub fn new(
        nlu: Option<Arc<dyn NluProvider>>,
        catalog: Arc<dyn CatalogService>,
        booking: Arc<BookingDesk>,
        handoff: Arc<HandoffCoordinator>,
        config: ChatConfig,
    ) -> Self {
        Self {
            nlu,
            catalog,
            booking,
            handoff,
            config,
            fallback_cursor: AtomicUsize::new(0),
        }
    }

    /// First local intent whose pattern matches the normalized text.
    pub fn match_local(&self, text: &str) -> Option<&IntentPattern> {
        let normalized = normalize(text);
        INTENT_TABLE
            .iter()
            .find(|entry| entry.matchers.iter().any(|re| re.is_match(&normalized)))
    }

    fn next_fallback(&self) -> &'static str {
        let index = self.fallback_cursor.fetch_add(1, Ordering::Relaxed);
        LOCAL_FALLBACKS[index % LOCAL_FALLBACKS.len()]
    }

    /// Drops any booking dialogue for the session, e.g. once it is handed to
    /// an operator.
    pub fn abandon_dialogue(&self, session_id: &str) -> bool {
        self.booking.abandon(session_id)
    }

    pub async fn resolve(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        text: &str,
    ) -> Result<Resolution, ChatError> {
        if self.booking.in_dialogue(session_id) {
            let reply = self
                .booking
                .handle(
                    session_id,
                    user_id,
                    BookingEvent::Input {
                        text: text.to_string(),
                        authenticated: user_id.is_some(),
                    },
                )
                .await?;
            return Ok(Resolution::from_booking(reply, TurnSource::Local));
        }

        if let Some(nlu) = &self.nlu {
            match nlu.detect_intent(session_id, text).await {
                Ok(result) => return self.fulfill(session_id, user_id, text, result).await,
                Err(error) => warn!(session_id, %error, "nlu unavailable, using local matcher"),
            }
        }

        self.resolve_locally(session_id, user_id, text).await
    }

    async fn fulfill(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        text: &str,
        result: NluResult,
    ) -> Result<Resolution, ChatError> {
        debug!(session_id, intent = %result.intent, confidence = result.confidence, "nlu result");
        if result.confidence < self.config.confidence_threshold {
            let mut resolution =
                Resolution::plain(self.config.fallback_message.clone(), TurnSource::Fallback);
            resolution.intent = Some(result.intent);
            resolution.confidence = Some(result.confidence);
            return Ok(resolution);
        }

        let known = Intent::from_label(&result.intent).and_then(|intent| {
            INTENT_TABLE
                .iter()
                .find(|entry| entry.intent == intent)
                .map(|entry| (intent, entry.handler))
        });
        let mut resolution = match known {
            Some((intent, handler))
                if intent.needs_lookup() || result.fulfillment_text.is_empty() =>
            {
                let entity = entity_from(&result.parameters);
                let ctx = IntentContext {
                    engine: self,
                    session_id,
                    user_id,
                    text,
                    entity: entity.as_deref(),
                };
                self.finish(handler(ctx).await?, intent, TurnSource::Remote, session_id, user_id)
                    .await?
            }
            _ if result.fulfillment_text.is_empty() => {
                Resolution::plain(self.config.fallback_message.clone(), TurnSource::Remote)
            }
            _ => Resolution::plain(result.fulfillment_text.clone(), TurnSource::Remote),
        };
        resolution.intent = Some(result.intent);
        resolution.confidence = Some(result.confidence);
        Ok(resolution)
    }

    pub async fn resolve_locally(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        text: &str,
    ) -> Result<Resolution, ChatError> {
        let Some(entry) = self.match_local(text) else {
            debug!(session_id, "no local intent matched");
            return Ok(Resolution::plain(self.next_fallback(), TurnSource::Fallback));
        };
        let ctx = IntentContext {
            engine: self,
            session_id,
            user_id,
            text,
            entity: None,
        };
        let outcome = (entry.handler)(ctx).await?;
        self.finish(outcome, entry.intent, TurnSource::Local, session_id, user_id)
            .await
    }

    async fn finish(
        &self,
        outcome: IntentOutcome,
        intent: Intent,
        source: TurnSource,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<Resolution, ChatError> {
        let mut resolution = match outcome {
            IntentOutcome::Reply {
                text,
                requires_auth,
            } => {
                let mut resolution = Resolution::plain(text, source);
                resolution.requires_auth = requires_auth;
                resolution
            }
            IntentOutcome::StartBooking => {
                let reply = self
                    .booking
                    .handle(session_id, user_id, BookingEvent::Begin)
                    .await?;
                Resolution::from_booking(reply, source)
            }
            IntentOutcome::Handoff { text, ticket } => {
                let mut resolution = Resolution::plain(text, source);
                resolution.handoff = Some(ticket);
                resolution
            }
        };
        resolution.intent = Some(intent.label().to_string());
        Ok(resolution)
    }
}

fn entity_from(parameters: &NluParameters) -> Option<String> {
    ["exam", "service", "examen", "code", "codigo"]
        .iter()
        .find_map(|key| parameters.get(*key).cloned())
}

/// Service named in free text: full name first, then its first word.
fn service_mentioned<'s>(text: &str, services: &'s [Service]) -> Option<&'s Service> {
    let text = normalize(text);
    services
        .iter()
        .find(|s| text.contains(&normalize(&s.name)))
        .or_else(|| {
            services.iter().find(|s| {
                normalize(&s.name)
                    .split_whitespace()
                    .next()
                    .is_some_and(|word| word.len() >= 5 && text.contains(word))
            })
        })
}

async fn lookup_service(ctx: &IntentContext<'_>) -> Result<(Option<Service>, Vec<Service>), ChatError> {
    let services = ctx.engine.catalog.list_services().await?;
    if let Some(entity) = ctx.entity {
        if let Some(found) = ctx.engine.catalog.find_service(entity).await? {
            return Ok((Some(found), services));
        }
        if let Some(found) = service_mentioned(entity, &services) {
            return Ok((Some(found.clone()), services));
        }
    }
    let found = service_mentioned(ctx.text, &services).cloned();
    Ok((found, services))
}

fn appointment_code(text: &str) -> Option<String> {
    let normalized = normalize(text);
    APPOINTMENT_CODE
        .captures(&normalized)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("LAB-{}", m.as_str().to_ascii_uppercase()))
}

fn greeting(_ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        Ok(IntentOutcome::text(
            "¡Hola! Soy el asistente virtual del laboratorio. Puedo ayudarte a agendar o cancelar citas, \
             consultar precios, preparación para tus exámenes, horarios y sedes. ¿En qué te ayudo?",
        ))
    })
}

fn thanks(_ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move { Ok(IntentOutcome::text("¡Con gusto! ¿Hay algo más en lo que pueda ayudarte?")) })
}

fn goodbye(_ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move { Ok(IntentOutcome::text("¡Hasta pronto! Que tengas un buen día.")) })
}

fn results_info(_ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        Ok(IntentOutcome::text(
            "Tus resultados se publican en el portal de pacientes, normalmente entre 24 y 48 horas \
             después de la toma de muestra. Te avisaremos cuando estén listos.",
        ))
    })
}

fn start_booking(_ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move { Ok(IntentOutcome::StartBooking) })
}

fn request_handoff(ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ticket = ctx
            .engine
            .handoff
            .request_handoff(ctx.session_id, ctx.user_id, Some(ctx.text))
            .await?;
        let text = match ticket.queue_position {
            0 => "Ya estás conversando con un operador.".to_string(),
            1 => "Te estoy comunicando con un operador. Eres el siguiente en la fila.".to_string(),
            n => format!("Te estoy comunicando con un operador. Tu posición en la fila es {n}."),
        };
        Ok(IntentOutcome::Handoff { text, ticket })
    })
}

fn cancel_appointment(ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let Some(user_id) = ctx.user_id else {
            return Ok(IntentOutcome::login("Para cancelar una cita necesitas iniciar sesión."));
        };
        let code = ctx
            .entity
            .and_then(appointment_code)
            .or_else(|| appointment_code(ctx.text));
        let Some(code) = code else {
            return Ok(IntentOutcome::text(
                "Indícame el código de la cita que quieres cancelar, por ejemplo: cancelar LAB-1A2B3C.",
            ));
        };
        let text = match ctx.engine.booking.cancel_appointment(&code, user_id).await? {
            CancelOutcome::Cancelled(appointment) => format!(
                "Listo, cancelé tu cita {} de {}. El cupo quedó liberado.",
                appointment.code, appointment.service_name
            ),
            CancelOutcome::NotFound => format!("No encontré una cita con el código {code} a tu nombre."),
            CancelOutcome::AlreadyTerminal(status) => format!(
                "La cita {code} no se puede cancelar porque ya está {}.",
                match status {
                    AppointmentStatus::Cancelled => "cancelada",
                    AppointmentStatus::Completed => "completada",
                    AppointmentStatus::Scheduled => "agendada",
                }
            ),
        };
        Ok(IntentOutcome::text(text))
    })
}

fn my_appointments(ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let Some(user_id) = ctx.user_id else {
            return Ok(IntentOutcome::login("Para ver tus citas necesitas iniciar sesión."));
        };
        let upcoming = ctx.engine.booking.upcoming(user_id).await?;
        if upcoming.is_empty() {
            return Ok(IntentOutcome::text(
                "No tienes citas próximas. Escribe \"agendar cita\" si quieres reservar una.",
            ));
        }
        Ok(IntentOutcome::text(render_appointments(&upcoming)))
    })
}

fn exam_price(ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let (found, services) = lookup_service(&ctx).await?;
        if let Some(service) = found {
            return Ok(IntentOutcome::text(format!(
                "El examen {} tiene un valor de {}.",
                service.name,
                format_price(service.price_cents)
            )));
        }
        if services.is_empty() {
            return Ok(IntentOutcome::text("Por ahora no tengo precios disponibles."));
        }
        let lines = services
            .iter()
            .map(|s| format!("- {}: {}", s.name, format_price(s.price_cents)))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(IntentOutcome::text(format!("Estos son nuestros precios:\n{lines}")))
    })
}

fn exam_preparation(ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let (found, services) = lookup_service(&ctx).await?;
        let describe = |s: &Service| match s.preparation.trim() {
            "" => format!("{}: no requiere preparación especial.", s.name),
            prep => format!("{}: {prep}", s.name),
        };
        if let Some(service) = found {
            return Ok(IntentOutcome::text(describe(&service)));
        }
        let lines = services.iter().map(describe).collect::<Vec<_>>().join("\n");
        Ok(IntentOutcome::text(format!(
            "¿Para qué examen necesitas la preparación?\n{lines}"
        )))
    })
}

fn opening_hours(ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let mut text = format!("Nuestro horario de atención: {}", ctx.engine.config.lab_hours);
        for location in ctx.engine.catalog.locations().await? {
            if !location.hours.trim().is_empty() {
                text.push_str(&format!("\n- {}: {}", location.name, location.hours));
            }
        }
        Ok(IntentOutcome::text(text))
    })
}

fn locations(ctx: IntentContext<'_>) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let all = ctx.engine.catalog.locations().await?;
        if all.is_empty() {
            return Ok(IntentOutcome::text("Por ahora no tengo sedes registradas."));
        }
        let lines = all
            .iter()
            .map(|l| format!("- {}: {}", l.name, l.address))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(IntentOutcome::text(format!("Estas son nuestras sedes:\n{lines}")))
    })
}
