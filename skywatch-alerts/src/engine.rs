use chrono::{SecondsFormat, Utc};
use skywatch_core::config::RulesConf;
use skywatch_core::rules::{self, AlertRule};
use skywatch_core::{AlertEvent, ConfigError, Reading};
use tracing::warn;

/// Evaluates every rule against every reading. Pure: no history, no debouncing,
/// so a sustained condition alerts on each reading.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<AlertRule>,
}

impl RuleEngine {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self { rules }
    }

    pub fn from_config(conf: &RulesConf) -> Result<Self, ConfigError> {
        Ok(Self::new(rules::resolve(conf)?))
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Alerts in rule order. A missing or blank field makes its rules no-ops.
    pub fn evaluate(&self, reading: &Reading) -> Vec<AlertEvent> {
        let city = reading.city();
        let timestamp = reading
            .timestamp()
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

        self.rules
            .iter()
            .filter_map(|rule| {
                let raw = reading.get(&rule.field)?.trim();
                if raw.is_empty() {
                    return None;
                }
                let value = match raw.parse::<f64>() {
                    Ok(v) => v,
                    Err(_) => {
                        warn!(
                            "rule {}: {}={raw:?} from {city} is not numeric, skipping",
                            rule.id, rule.field
                        );
                        return None;
                    }
                };
                rule.comparator
                    .holds(value, rule.threshold)
                    .then(|| AlertEvent {
                        timestamp: timestamp.clone(),
                        city: city.to_string(),
                        rule_id: rule.id.clone(),
                        severity: rule.severity,
                        message: rule.render(city, raw),
                    })
            })
            .collect()
    }
}
