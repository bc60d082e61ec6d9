//! Human-readable grant durations: `30m`, `2h`, `1.5d`, `1h30m`, `1w`.
//! `0`, `permanent`, `never` mean an open-ended grant.

use chrono::Duration;

/// Parse a duration string into a validity span. `Ok(None)` means
/// open-ended; `Err` carries the offending input.
pub fn parse_duration(input: &str) -> Result<Option<Duration>, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "0" | "permanent" | "never" | "infinity" => return Ok(None),
        _ => {}
    }

    let mut total_minutes = 0f64;
    let mut number = String::new();
    let mut unit = String::new();
    let mut segments: Vec<(String, String)> = Vec::new();

    for c in trimmed.chars() {
        if c.is_ascii_digit() || c == '.' {
            if !unit.is_empty() {
                segments.push((number.clone(), unit.clone()));
                number.clear();
                unit.clear();
            }
            number.push(c);
        } else if c.is_ascii_alphabetic() {
            if number.is_empty() && segments.is_empty() && unit.is_empty() {
                return Err(format!("invalid duration: {input}"));
            }
            unit.push(c);
        } else if !c.is_whitespace() {
            return Err(format!("invalid duration: {input}"));
        }
    }
    if !number.is_empty() {
        segments.push((number, unit));
    }

    if segments.is_empty() {
        return Err(format!("invalid duration: {input}"));
    }

    for (value, unit) in segments {
        let value: f64 = value
            .parse()
            .map_err(|_| format!("invalid duration: {input}"))?;
        // A bare capital 'M' means months (lowercase 'm' is minutes);
        // normalize it first, then lowercase for one table lookup.
        let unit = if unit == "M" {
            "mo".to_string()
        } else {
            unit.to_ascii_lowercase()
        };
        let per_unit_minutes = match unit.as_str() {
            "" | "m" | "min" | "mins" | "minute" | "minutes" => 1.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => 60.0,
            "d" | "day" | "days" => 1_440.0,
            "w" | "week" | "weeks" => 10_080.0,
            "mo" | "mon" | "month" | "months" => 43_200.0,
            "y" | "year" | "years" => 525_600.0,
            "s" | "sec" | "secs" | "second" | "seconds" => 1.0 / 60.0,
            _ => return Err(format!("unknown duration unit: {unit}")),
        };
        total_minutes += value * per_unit_minutes;
    }

    if total_minutes <= 0.0 {
        return Ok(None);
    }
    Ok(Some(Duration::seconds((total_minutes * 60.0).round() as i64)))
}
