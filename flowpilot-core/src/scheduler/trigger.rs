//! Trigger configuration validation and next-fire computation

use crate::error::{FlowError, FlowResult};
use crate::models::schedule::{Trigger, TriggerType};
use crate::scheduler::cron::CronExpression;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

/// Longest accepted interval, one hundred years
pub const MAX_INTERVAL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Build a validated trigger from its type and raw config
pub fn parse_trigger(trigger_type: TriggerType, config: &Value) -> FlowResult<Trigger> {
    match trigger_type {
        TriggerType::Cron => {
            let expression = required_str(config, "expression", trigger_type)?;
            CronExpression::parse(expression)?;
            Ok(Trigger::Cron {
                expression: expression.trim().to_string(),
            })
        }
        TriggerType::Interval => {
            let seconds = match config.get("seconds") {
                Some(Value::Number(n)) => n.as_u64().filter(|s| *s > 0),
                _ => None,
            }
            .ok_or_else(|| {
                FlowError::Validation(
                    "interval trigger needs 'seconds' as a positive integer".to_string(),
                )
            })?;
            if seconds > MAX_INTERVAL_SECONDS {
                return Err(FlowError::Validation(format!(
                    "interval of {} seconds exceeds the maximum of {}",
                    seconds, MAX_INTERVAL_SECONDS
                )));
            }
            Ok(Trigger::Interval { seconds })
        }
        TriggerType::Webhook => Ok(Trigger::Webhook {
            webhook_id: required_str(config, "webhook_id", trigger_type)?.to_string(),
        }),
        TriggerType::Event => Ok(Trigger::Event {
            event_type: required_str(config, "event_type", trigger_type)?.to_string(),
        }),
        TriggerType::Manual => Ok(Trigger::Manual),
    }
}

/// Raw config of a trigger, the inverse of `parse_trigger`
pub fn trigger_config(trigger: &Trigger) -> Value {
    match serde_json::to_value(trigger) {
        Ok(Value::Object(mut map)) => {
            map.remove("type");
            Value::Object(map)
        }
        _ => Value::Object(Map::new()),
    }
}

/// When a polled trigger fires next; `None` for triggers the poll loop ignores
pub fn next_execution(trigger: &Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::Cron { expression } => match CronExpression::parse(expression) {
            Ok(cron) => cron.next_after(now),
            Err(err) => {
                tracing::warn!("Stored cron trigger no longer parses: {}", err);
                None
            }
        },
        Trigger::Interval { seconds } => {
            let seconds = i64::try_from(*seconds).ok()?;
            now.checked_add_signed(Duration::try_seconds(seconds)?)
        }
        Trigger::Webhook { .. } | Trigger::Event { .. } | Trigger::Manual => None,
    }
}

fn required_str<'a>(config: &'a Value, key: &str, trigger_type: TriggerType) -> FlowResult<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            FlowError::Validation(format!(
                "{} trigger needs a non-empty '{}'",
                trigger_type, key
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_interval_requires_positive_integer() {
        assert_eq!(
            parse_trigger(TriggerType::Interval, &json!({"seconds": 90})).unwrap(),
            Trigger::Interval { seconds: 90 }
        );
        for config in [
            json!({"seconds": 0}),
            json!({"seconds": -5}),
            json!({"seconds": 1.5}),
            json!({"seconds": "60"}),
            json!({}),
        ] {
            assert!(parse_trigger(TriggerType::Interval, &config).is_err(), "{}", config);
        }
    }

    #[test]
    fn test_interval_overflow_is_rejected() {
        let err = parse_trigger(
            TriggerType::Interval,
            &json!({"seconds": 10_000_000_000_000u64}),
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        assert!(parse_trigger(
            TriggerType::Interval,
            &json!({"seconds": MAX_INTERVAL_SECONDS})
        )
        .is_ok());

        // Stored triggers that bypassed validation yield no next run
        let now = Utc::now();
        for seconds in [10_000_000_000_000u64, u64::MAX] {
            assert_eq!(next_execution(&Trigger::Interval { seconds }, now), None);
        }
    }

    #[test]
    fn test_cron_and_keyed_triggers() {
        assert!(parse_trigger(TriggerType::Cron, &json!({"expression": "*/5 * * * *"})).is_ok());
        assert!(parse_trigger(TriggerType::Cron, &json!({"expression": "every day"})).is_err());
        assert!(parse_trigger(TriggerType::Webhook, &json!({"webhook_id": " "})).is_err());
        assert_eq!(
            parse_trigger(TriggerType::Event, &json!({"event_type": "lead.created"})).unwrap(),
            Trigger::Event {
                event_type: "lead.created".into()
            }
        );
        assert_eq!(parse_trigger(TriggerType::Manual, &Value::Null).unwrap(), Trigger::Manual);
    }

    #[test]
    fn test_next_execution_per_trigger() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 7, 12).unwrap();
        let cron = Trigger::Cron {
            expression: "*/5 * * * *".into(),
        };
        assert_eq!(
            next_execution(&cron, now),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 10, 0).unwrap())
        );
        assert_eq!(
            next_execution(&Trigger::Interval { seconds: 30 }, now),
            Some(now + Duration::seconds(30))
        );
        assert_eq!(next_execution(&Trigger::Manual, now), None);
    }

    #[test]
    fn test_trigger_config_round_trips() {
        let trigger = Trigger::Webhook {
            webhook_id: "crm-sync".into(),
        };
        let config = trigger_config(&trigger);
        assert_eq!(config, json!({"webhook_id": "crm-sync"}));
        assert_eq!(parse_trigger(TriggerType::Webhook, &config).unwrap(), trigger);
    }
}
