//! Parsing of the period fields shared by the forms (`semaine`, `mois`,
//! `annee`).

use crate::error::{AppError, AppResult};

fn number<T: std::str::FromStr>(label: &str, text: &str) -> AppResult<T> {
    text.trim()
        .parse()
        .map_err(|_| AppError::Validation(format!("{} invalide : {}", label, text.trim())))
}

fn within<T: PartialOrd + std::fmt::Display + Copy>(label: &str, value: T, lo: T, hi: T) -> AppResult<T> {
    if value < lo || value > hi {
        return Err(AppError::Validation(format!("{} invalide : {}", label, value)));
    }
    Ok(value)
}

pub fn week(text: &str) -> AppResult<u32> {
    within("Semaine", number("Semaine", text)?, 1, 53)
}

pub fn month(text: &str) -> AppResult<u32> {
    within("Mois", number("Mois", text)?, 1, 12)
}

pub fn year(text: &str) -> AppResult<i32> {
    within("Année", number("Année", text)?, 2000, 2100)
}

/// Blank or absent fields are `None`; anything else must parse.
pub fn optional<T>(text: Option<&str>, parse: impl Fn(&str) -> AppResult<T>) -> AppResult<Option<T>> {
    match text.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => parse(text).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges() {
        assert_eq!(week(" 12 ").unwrap(), 12);
        assert!(week("0").is_err());
        assert!(week("54").is_err());
        assert!(month("13").is_err());
        assert_eq!(year("2025").unwrap(), 2025);
        assert!(year("25x").is_err());
    }

    #[test]
    fn optional_fields() {
        assert_eq!(optional(None, week).unwrap(), None);
        assert_eq!(optional(Some("  "), week).unwrap(), None);
        assert_eq!(optional(Some("7"), week).unwrap(), Some(7));
        let err = optional(Some("x"), week).unwrap_err();
        assert_eq!(err.to_string(), "Semaine invalide : x");
    }
}
