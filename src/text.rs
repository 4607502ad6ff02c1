use chrono::{Datelike, NaiveDate, Weekday};

/// Lowercase, fold Spanish accents, drop punctuation, collapse whitespace.
pub fn normalize(input: &str) -> String {
    let folded = input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            '¿' | '?' | '¡' | '!' | ',' | ';' | '.' | '"' | '\'' => ' ',
            other => other,
        })
        .collect::<String>();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

const AFFIRMATIVE: &[&str] = &[
    "si", "s", "claro", "confirmar", "confirmo", "confirma", "ok", "okay", "dale", "de acuerdo",
    "correcto", "por supuesto", "si confirmo", "si por favor", "yes",
];

const NEGATIVE: &[&str] = &["no", "n", "no gracias", "mejor no", "negativo", "no quiero"];

pub fn is_affirmative(input: &str) -> bool {
    let text = normalize(input);
    AFFIRMATIVE.contains(&text.as_str())
}

pub fn is_negative(input: &str) -> bool {
    let text = normalize(input);
    NEGATIVE.contains(&text.as_str())
}

/// `1` based ordinal typed by the user ("2", "opcion 2", "la 2").
pub fn parse_ordinal(input: &str) -> Option<usize> {
    let text = normalize(input);
    let digits = text
        .split_whitespace()
        .filter(|word| !matches!(*word, "opcion" | "la" | "el" | "numero" | "n"))
        .collect::<Vec<_>>();
    match digits.as_slice() {
        [single] => single.parse::<usize>().ok().filter(|n| *n > 0),
        _ => None,
    }
}

pub fn weekday_from_es(word: &str) -> Option<Weekday> {
    match word {
        "lunes" => Some(Weekday::Mon),
        "martes" => Some(Weekday::Tue),
        "miercoles" => Some(Weekday::Wed),
        "jueves" => Some(Weekday::Thu),
        "viernes" => Some(Weekday::Fri),
        "sabado" => Some(Weekday::Sat),
        "domingo" => Some(Weekday::Sun),
        _ => None,
    }
}

fn weekday_es(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "lunes",
        Weekday::Tue => "martes",
        Weekday::Wed => "miércoles",
        Weekday::Thu => "jueves",
        Weekday::Fri => "viernes",
        Weekday::Sat => "sábado",
        Weekday::Sun => "domingo",
    }
}

fn month_es(month: u32) -> &'static str {
    const MONTHS: [&str; 12] = [
        "enero",
        "febrero",
        "marzo",
        "abril",
        "mayo",
        "junio",
        "julio",
        "agosto",
        "septiembre",
        "octubre",
        "noviembre",
        "diciembre",
    ];
    MONTHS
        .get(month.saturating_sub(1) as usize)
        .copied()
        .unwrap_or("")
}

/// "viernes 10 de enero"
pub fn format_date_es(date: NaiveDate) -> String {
    format!(
        "{} {} de {}",
        weekday_es(date.weekday()),
        date.day(),
        month_es(date.month())
    )
}

/// `1_500_000` cents -> "$15.000"
pub fn format_price(price_cents: i64) -> String {
    let units = price_cents / 100;
    let digits = units.abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(c);
    }
    let sign = if units < 0 { "-" } else { "" };
    let cents = (price_cents % 100).abs();
    if cents == 0 {
        format!("{sign}${grouped}")
    } else {
        format!("{sign}${grouped},{cents:02}")
    }
}
