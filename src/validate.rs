use std::collections::BTreeMap;

/// Field-level validation failures, collected the way a form collects them
/// so the client can show every problem at once.
#[derive(Debug, Default, Clone, PartialEq, thiserror::Error)]
#[error("validation failed: {}", summary(.fields))]
pub struct ValidationError {
    pub fields: BTreeMap<String, String>,
}

fn summary(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut e = Self::new();
        e.add(field, message);
        e
    }

    /// Keeps the first message per field.
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.fields
            .entry(field.to_string())
            .or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

pub fn is_hex_color(raw: &str) -> bool {
    let b = raw.as_bytes();
    b.len() == 7 && b[0] == b'#' && b[1..].iter().all(|c| c.is_ascii_hexdigit())
}

/// Loose address check: something before `@`, a dot somewhere after it.
pub fn is_email(raw: &str) -> bool {
    let Some((local, domain)) = raw.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain
            .split_once('.')
            .map(|(a, b)| !a.is_empty() && !b.is_empty())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_per_field_wins() {
        let mut e = ValidationError::new();
        e.add("end", "must be after start");
        e.add("end", "too long");
        assert_eq!(e.fields.get("end").map(String::as_str), Some("must be after start"));
        assert!(e.clone().into_result().is_err());
        assert_eq!(e.to_string(), "validation failed: end: must be after start");
    }

    #[test]
    fn color_and_email_checks() {
        assert!(is_hex_color("#FF7A00"));
        assert!(!is_hex_color("FF7A00"));
        assert!(!is_hex_color("#FF7A0G"));
        assert!(is_email("ana@uni.br"));
        assert!(!is_email("ana@uni"));
        assert!(!is_email("@uni.br"));
        assert!(!is_email("ana@@uni.br"));
    }
}
