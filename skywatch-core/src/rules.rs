//! Threshold rule definitions and the built-in profiles.
//!
//! Rules are plain data so they can come from config; evaluation lives in
//! the alerts service.

use crate::config::RulesConf;
use crate::error::ConfigError;
use crate::models::Severity;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = "<", alias = "lt")]
    Lt,
}

impl Comparator {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Lt => value < threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Lt => "<",
        }
    }
}

/// `(field, comparator, threshold, message)` plus identity and severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub field: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub severity: Severity,
    /// Template; `{city}`, `{value}`, `{field}` and `{threshold}` are substituted.
    pub message: String,
}

impl AlertRule {
    pub fn new(
        id: &str,
        field: &str,
        comparator: Comparator,
        threshold: f64,
        severity: Severity,
        message: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            field: field.to_string(),
            comparator,
            threshold,
            severity,
            message: message.to_string(),
        }
    }

    pub fn render(&self, city: &str, value: &str) -> String {
        self.message
            .replace("{city}", city)
            .replace("{value}", value)
            .replace("{field}", &self.field)
            .replace("{threshold}", &self.threshold.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProfile {
    /// Strict cutoffs used by the alert log consumer.
    #[default]
    Demo,
    /// Comfort-oriented cutoffs shared with the dashboard and daily summary.
    Friendly,
}

impl FromStr for RuleProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "demo" => Ok(RuleProfile::Demo),
            "friendly" => Ok(RuleProfile::Friendly),
            other => Err(ConfigError::invalid(
                "rules.profile",
                format!("unknown profile '{other}' (expected demo or friendly)"),
            )),
        }
    }
}

impl RuleProfile {
    pub fn rules(self) -> Vec<AlertRule> {
        use Comparator::*;
        match self {
            RuleProfile::Demo => vec![
                AlertRule::new(
                    "high-temperature",
                    "temperature_c",
                    Gt,
                    35.0,
                    Severity::Critical,
                    "🚨 HIGH TEMP ALERT! City: {city}, Temperature: {value}°C",
                ),
                AlertRule::new(
                    "low-humidity",
                    "humidity",
                    Lt,
                    20.0,
                    Severity::Warning,
                    "💧 LOW HUMIDITY ALERT! City: {city}, Humidity: {value}%",
                ),
                AlertRule::new(
                    "high-wind",
                    "wind_speed",
                    Gt,
                    3.0,
                    Severity::Warning,
                    "🌪️ HIGH WIND SPEED ALERT! City: {city}, Wind Speed: {value} km/h",
                ),
                AlertRule::new(
                    "high-pressure",
                    "pressure",
                    Gt,
                    1000.0,
                    Severity::Advisory,
                    "🌧️ HIGH PRESSURE ALERT! City: {city}, Pressure: {value} hPa",
                ),
            ],
            RuleProfile::Friendly => vec![
                AlertRule::new(
                    "low-temperature",
                    "temperature_c",
                    Lt,
                    19.0,
                    Severity::Info,
                    "❄️ LOW TEMP ALERT! City: {city}, Temperature: {value}°C (Bundle up, it's chilly!)",
                ),
                AlertRule::new(
                    "moderate-high-temperature",
                    "temperature_c",
                    Gt,
                    23.0,
                    Severity::Advisory,
                    "🔥 MODERATE HIGH TEMP ALERT! City: {city}, Temperature: {value}°C (Feels warm!)",
                ),
                AlertRule::new(
                    "low-humidity",
                    "humidity",
                    Lt,
                    45.0,
                    Severity::Warning,
                    "💧 LOW HUMIDITY ALERT! City: {city}, Humidity: {value}% (Stay hydrated!)",
                ),
                AlertRule::new(
                    "high-humidity",
                    "humidity",
                    Gt,
                    80.0,
                    Severity::Warning,
                    "🌫️ HIGH HUMIDITY ALERT! City: {city}, Humidity: {value}% (It feels muggy!)",
                ),
                AlertRule::new(
                    "high-wind",
                    "wind_speed",
                    Gt,
                    10.0,
                    Severity::Warning,
                    "🍃 HIGH WIND ALERT! City: {city}, Wind Speed: {value} km/h (Take care if outside!)",
                ),
            ],
        }
    }
}

/// Profile rules, with threshold overrides applied and extra rules appended.
pub fn resolve(conf: &RulesConf) -> Result<Vec<AlertRule>, ConfigError> {
    let mut rules = conf.profile.rules();

    for (id, threshold) in &conf.overrides {
        let rule = rules.iter_mut().find(|r| &r.id == id).ok_or_else(|| {
            ConfigError::invalid(
                "rules.overrides",
                format!("no rule '{id}' in profile {:?}", conf.profile),
            )
        })?;
        rule.threshold = *threshold;
    }

    rules.extend(conf.extra.iter().cloned());

    let mut seen = HashSet::new();
    for rule in &rules {
        if !seen.insert(rule.id.as_str()) {
            return Err(ConfigError::invalid(
                "rules.extra",
                format!("duplicate rule id '{}'", rule.id),
            ));
        }
        if !rule.threshold.is_finite() {
            return Err(ConfigError::invalid(
                "rules",
                format!("rule '{}' has a non-finite threshold", rule.id),
            ));
        }
        if rule.field.trim().is_empty() {
            return Err(ConfigError::invalid(
                "rules",
                format!("rule '{}' has no field", rule.id),
            ));
        }
    }

    Ok(rules)
}
