use minijinja::{context, Environment};

use crate::text::format_date_es;
use crate::types::{Appointment, BookingSummary};

const OPTIONS_TEMPLATE: &str = include_str!("prompts/options.j2");
const BOOKING_CONFIRMED_TEMPLATE: &str = include_str!("prompts/booking_confirmed.j2");
const APPOINTMENTS_TEMPLATE: &str = include_str!("prompts/appointments.j2");

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    let template = env.get_template(name).ok()?;
    template.render(ctx).ok().map(|text| text.trim().to_string())
}

/// A heading, a numbered list and an optional footer.
pub fn render_options(heading: &str, options: &[String], footer: &str) -> String {
    render(
        "options",
        OPTIONS_TEMPLATE,
        context! { heading => heading, options => options, footer => footer },
    )
    .unwrap_or_else(|| {
        let mut text = heading.to_string();
        for (i, option) in options.iter().enumerate() {
            text.push_str(&format!("\n{}. {}", i + 1, option));
        }
        if !footer.is_empty() {
            text.push_str("\n\n");
            text.push_str(footer);
        }
        text
    })
}

pub fn render_booking_confirmed(summary: &BookingSummary, preparation: &str) -> String {
    let code = summary.code.clone().unwrap_or_default();
    render(
        "booking_confirmed",
        BOOKING_CONFIRMED_TEMPLATE,
        context! {
            service_name => &summary.service_name,
            date => format_date_es(summary.date),
            start_time => &summary.start_time,
            location_name => &summary.location_name,
            code => &code,
            preparation => preparation.trim(),
        },
    )
    .unwrap_or_else(|| {
        format!(
            "¡Listo! Tu cita de {} quedó agendada para el {} a las {}. Código: {}",
            summary.service_name,
            format_date_es(summary.date),
            summary.start_time,
            code
        )
    })
}

pub fn render_appointments(appointments: &[Appointment]) -> String {
    let items = appointments
        .iter()
        .map(|a| {
            context! {
                code => &a.code,
                service_name => &a.service_name,
                date => format_date_es(a.date),
                start_time => &a.start_time,
                location_name => &a.location_name,
            }
        })
        .collect::<Vec<_>>();
    render(
        "appointments",
        APPOINTMENTS_TEMPLATE,
        context! { appointments => items },
    )
    .unwrap_or_else(|| {
        appointments
            .iter()
            .map(|a| format!("{}: {} {} {}", a.code, a.service_name, a.date, a.start_time))
            .collect::<Vec<_>>()
            .join("\n")
    })
}
