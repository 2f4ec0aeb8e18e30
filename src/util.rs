use std::time::Duration;

/// Parse a Go-style duration string into a `Duration`.
///
/// Accepts a sequence of `<number><unit>` pairs such as `"1h"`, `"5m"`,
/// `"1h30m"`, `"1.5s"` or `"500ms"`. Units: `ns`, `us`/`µs`, `ms`, `s`, `m`,
/// `h`. A bare `"0"` is accepted as zero.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".into());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        // Split into numeric part and unit
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{s}'"))?;
        let (num_str, tail) = rest.split_at(num_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);

        let num: f64 = num_str
            .parse()
            .map_err(|_| format!("invalid duration number '{num_str}' in '{s}'"))?;

        let unit_secs: f64 = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("unknown unit '{unit}' in duration '{s}' (use h, m, s, ms)")),
        };

        total += Duration::try_from_secs_f64(num * unit_secs)
            .map_err(|e| format!("duration '{s}' out of range: {e}"))?;
        rest = tail;
    }

    Ok(total)
}

/// Quote a word for a POSIX shell, leaving it bare when it only contains
/// characters no shell treats specially.
pub fn shell_quote(word: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// Join an argument vector into a single command line.
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
