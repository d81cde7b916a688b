use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const UNKNOWN_CITY: &str = "UnknownCity";

/// One sensor observation: a flat field -> raw value mapping.
///
/// Values stay as the text found in the CSV row so unknown fields pass
/// through untouched; numeric interpretation happens in the rule engine.
/// Fields are kept sorted, which makes the transport encoding canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reading {
    fields: BTreeMap<String, String>,
}

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Builder-style insert, handy for fixtures.
    pub fn with(mut self, field: &str, value: impl ToString) -> Self {
        self.insert(field, value.to_string());
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn city(&self) -> &str {
        match self.get("city") {
            Some(city) if !city.trim().is_empty() => city,
            _ => UNKNOWN_CITY,
        }
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.get("timestamp").filter(|ts| !ts.trim().is_empty())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, String)> for Reading {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Advisory,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "INFO",
            Severity::Advisory => "ADVISORY",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Output of a fired rule. Built once, handed to the sink, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub timestamp: String,
    pub city: String,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn city_defaults_when_absent_or_blank() {
        assert_eq!(Reading::new().city(), UNKNOWN_CITY);
        assert_eq!(Reading::new().with("city", "  ").city(), UNKNOWN_CITY);
        assert_eq!(Reading::new().with("city", "Cairo").city(), "Cairo");
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let r = Reading::new()
            .with("weather", "clear sky")
            .with("temperature_c", 21.5);
        assert_eq!(r.get("weather"), Some("clear sky"));
        assert_eq!(r.get("temperature_c"), Some("21.5"));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn severity_serializes_lowercase() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        assert_eq!(Severity::Advisory.to_string(), "ADVISORY");
    }
}
