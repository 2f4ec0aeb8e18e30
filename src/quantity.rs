use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("quantity cannot be empty")]
    Empty,

    #[error("invalid quantity number: '{0}'")]
    InvalidNumber(String),

    #[error("unknown quantity suffix: '{0}' (use Ki, Mi, Gi, m, k, M, G, ... or an exponent like 1e3)")]
    UnknownSuffix(String),
}

/// Validate a Kubernetes resource quantity such as `"1"`, `"500m"`, `"1Gi"`,
/// `"1.5G"` or `"1e3"`, returning it in the wire form the API server expects.
///
/// The API server does the canonical parse; this only checks the grammar so a
/// typo is reported against the flag that carried it instead of as an opaque
/// admission failure.
pub fn parse_quantity(s: &str) -> Result<Quantity, QuantityError> {
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let unsigned = s.strip_prefix(['+', '-']).unwrap_or(s);

    // Split into numeric part and suffix
    let split = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (num_str, suffix) = unsigned.split_at(split);

    if !is_number(num_str) {
        return Err(QuantityError::InvalidNumber(num_str.to_string()));
    }

    match suffix {
        "" | "n" | "u" | "m" | "k" | "M" | "G" | "T" | "P" | "E" => {}
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => {}
        _ if is_exponent(suffix) => {}
        _ => return Err(QuantityError::UnknownSuffix(suffix.to_string())),
    }

    Ok(Quantity(s.to_string()))
}

/// `<digits>`, `<digits>.<digits>`, `<digits>.` or `.<digits>`.
fn is_number(s: &str) -> bool {
    let (int, frac) = match s.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (s, None),
    };
    let digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    match frac {
        None => !int.is_empty() && digits(int),
        Some(frac) => (!int.is_empty() || !frac.is_empty()) && digits(int) && digits(frac),
    }
}

/// `e<int>` / `E<int>` with an optional sign on the exponent.
fn is_exponent(s: &str) -> bool {
    let Some(exp) = s.strip_prefix(['e', 'E']) else {
        return false;
    };
    let exp = exp.strip_prefix(['+', '-']).unwrap_or(exp);
    !exp.is_empty() && exp.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_quantity_plain_numbers() {
        assert_eq!(parse_quantity("1").unwrap().0, "1");
        assert_eq!(parse_quantity("0.5").unwrap().0, "0.5");
        assert_eq!(parse_quantity(".5").unwrap().0, ".5");
        assert_eq!(parse_quantity("2.").unwrap().0, "2.");
    }

    #[test]
    fn parse_quantity_binary_suffixes() {
        for q in ["1Ki", "512Mi", "1Gi", "2Ti", "1Pi", "1Ei"] {
            parse_quantity(q).unwrap();
        }
    }

    #[test]
    fn parse_quantity_decimal_suffixes() {
        for q in ["500m", "100n", "3u", "1k", "1M", "1.5G", "4T", "1P", "1E"] {
            parse_quantity(q).unwrap();
        }
    }

    #[test]
    fn parse_quantity_exponents() {
        for q in ["1e3", "1E3", "12e-3", "1e+6"] {
            parse_quantity(q).unwrap();
        }
    }

    #[test]
    fn parse_quantity_signed() {
        parse_quantity("-1").unwrap();
        parse_quantity("+1Gi").unwrap();
    }

    #[test]
    fn parse_quantity_rejects_empty() {
        assert_eq!(parse_quantity(""), Err(QuantityError::Empty));
    }

    #[test]
    fn parse_quantity_rejects_bad_suffix() {
        assert_eq!(
            parse_quantity("1x"),
            Err(QuantityError::UnknownSuffix("x".into()))
        );
        assert!(parse_quantity("1GB").is_err());
        assert!(parse_quantity("1e").is_err());
        assert!(parse_quantity("1 Gi").is_err());
    }

    #[test]
    fn parse_quantity_rejects_bad_number() {
        assert!(matches!(parse_quantity("Gi"), Err(QuantityError::InvalidNumber(_))));
        assert!(matches!(parse_quantity("."), Err(QuantityError::InvalidNumber(_))));
        assert!(matches!(parse_quantity("1.2.3"), Err(QuantityError::InvalidNumber(_))));
        assert!(matches!(parse_quantity("-"), Err(QuantityError::InvalidNumber(_))));
    }
}
