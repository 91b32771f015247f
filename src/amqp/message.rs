//! Wire payloads exchanged with the broker
//!
//! All bodies are UTF-8 JSON. Configuration messages travel in both
//! directions: inbound they reconfigure the device, outbound they carry the
//! last known device state.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// An RGB triple as sent to the device
pub type Rgb = [u8; 3];

/// Blink pattern of a single key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlinkMode {
    Single,
    Short,
    Long,
    #[default]
    Off,
}

impl fmt::Display for BlinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BlinkMode::Single => "SINGLE",
            BlinkMode::Short => "SHORT",
            BlinkMode::Long => "LONG",
            BlinkMode::Off => "OFF",
        };
        f.write_str(label)
    }
}

/// Steady color of one key, `idx` is 1-based
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColor {
    pub idx: u8,
    pub color: Rgb,
}

/// Blink setting of one key, `idx` is 1-based
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBlink {
    pub idx: u8,
    pub mode: BlinkMode,
    pub color: Rgb,
}

/// Body of a configuration message
///
/// Every field is optional on the way in so partial updates (only a new
/// brightness, only one key color) decode cleanly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(default)]
    pub keys: Vec<KeyColor>,
    #[serde(default)]
    pub blink: Vec<KeyBlink>,
}

/// `{"configuration": {...}}` envelope used in both directions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationMessage {
    #[serde(default)]
    pub configuration: DeviceConfiguration,
}

impl ConfigurationMessage {
    pub fn new(configuration: DeviceConfiguration) -> Self {
        Self { configuration }
    }

    /// Decodes an already parsed body snippet by snippet
    ///
    /// A snippet that does not fit (an unknown blink mode, a color out of
    /// range, an unknown field) is skipped and described in the returned
    /// list. Everything else is kept, so one bad entry does not cost the rest
    /// of the update.
    pub fn from_value_lenient(body: &Value) -> (Self, Vec<String>) {
        let mut rejected = Vec::new();
        let mut configuration = DeviceConfiguration::default();

        let fields = match body.get("configuration") {
            None | Some(Value::Null) => None,
            Some(Value::Object(fields)) => Some(fields),
            Some(other) => {
                rejected.push(format!("configuration must be an object, got {other}"));
                None
            }
        };
        if !body.is_object() {
            rejected.push(format!("message must be an object, got {body}"));
        }

        for (name, value) in fields.into_iter().flatten() {
            match name.as_str() {
                "brightness" if value.is_null() => {}
                "brightness" => match u8::deserialize(value) {
                    Ok(brightness) => configuration.brightness = Some(brightness),
                    Err(e) => rejected.push(format!("brightness {value}: {e}")),
                },
                "keys" => configuration.keys = entries(name, value, &mut rejected),
                "blink" => configuration.blink = entries(name, value, &mut rejected),
                unknown => rejected.push(format!("unknown field {unknown}")),
            }
        }

        (Self { configuration }, rejected)
    }
}

fn entries<T: DeserializeOwned>(name: &str, value: &Value, rejected: &mut Vec<String>) -> Vec<T> {
    let items = match value {
        Value::Null => return Vec::new(),
        Value::Array(items) => items,
        other => {
            rejected.push(format!("{name} must be a list, got {other}"));
            return Vec::new();
        }
    };
    items
        .iter()
        .filter_map(|item| match T::deserialize(item) {
            Ok(entry) => Some(entry),
            Err(e) => {
                rejected.push(format!("{name} entry {item}: {e}"));
                None
            }
        })
        .collect()
}

/// `{"key": n}` published when a key is pressed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub key: u8,
}

/// Error report published on the status routing key when an inbound
/// configuration cannot be decoded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub error: ErrorDetails,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
    pub details: String,
    pub original: String,
}

impl StatusError {
    pub const INVALID_CONFIGURATION: &'static str = "Invalid JSON received for configuration";

    /// Report for a configuration body that failed to decode
    pub fn invalid_configuration(details: impl Into<String>, original: &[u8]) -> Self {
        Self {
            error: ErrorDetails {
                message: Self::INVALID_CONFIGURATION.to_string(),
                details: details.into(),
                original: String::from_utf8_lossy(original).into_owned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_configuration_decodes() {
        let body = json!({
            "configuration": {
                "brightness": 128,
                "keys": [{"idx": 1, "color": [255, 0, 0]}],
                "blink": [{"idx": 2, "mode": "SHORT", "color": [0, 0, 255]}]
            }
        });
        let message: ConfigurationMessage = serde_json::from_value(body).unwrap();

        assert_eq!(message.configuration.brightness, Some(128));
        assert_eq!(message.configuration.keys[0], KeyColor { idx: 1, color: [255, 0, 0] });
        assert_eq!(message.configuration.blink[0].mode, BlinkMode::Short);
    }

    #[test]
    fn partial_configuration_decodes() {
        let message: ConfigurationMessage =
            serde_json::from_str(r#"{"configuration": {"brightness": 10}}"#).unwrap();
        assert_eq!(message.configuration.brightness, Some(10));
        assert!(message.configuration.keys.is_empty());

        let empty: ConfigurationMessage = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ConfigurationMessage::default());
    }

    #[test]
    fn unknown_blink_mode_is_rejected() {
        let result = serde_json::from_str::<ConfigurationMessage>(
            r#"{"configuration": {"blink": [{"idx": 1, "mode": "FAST", "color": [0, 0, 0]}]}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn lenient_decoding_keeps_valid_snippets() {
        let body = json!({"configuration": {
            "brightness": 10,
            "keys": [{"idx": 1, "color": [1, 2, 3]}, {"idx": 2, "color": [300, 0, 0]}],
            "blink": [{"idx": 1, "mode": "FAST", "color": [0, 0, 0]}],
            "volume": 3
        }});
        let (message, rejected) = ConfigurationMessage::from_value_lenient(&body);

        assert_eq!(message.configuration.brightness, Some(10));
        assert_eq!(message.configuration.keys, vec![KeyColor { idx: 1, color: [1, 2, 3] }]);
        assert!(message.configuration.blink.is_empty());
        assert_eq!(rejected.len(), 3);
        assert!(rejected.iter().any(|reason| reason.contains("FAST")));
        assert!(rejected.iter().any(|reason| reason.contains("volume")));
    }

    #[test]
    fn lenient_decoding_of_odd_envelopes() {
        let (message, rejected) = ConfigurationMessage::from_value_lenient(&json!({}));
        assert_eq!(message, ConfigurationMessage::default());
        assert!(rejected.is_empty());

        let (message, rejected) =
            ConfigurationMessage::from_value_lenient(&json!({"configuration": {"brightness": null}}));
        assert_eq!(message.configuration.brightness, None);
        assert!(rejected.is_empty());

        let (_, rejected) = ConfigurationMessage::from_value_lenient(&json!([1, 2]));
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn key_event_shape() {
        assert_eq!(serde_json::to_value(KeyEvent { key: 3 }).unwrap(), json!({"key": 3}));
    }

    #[test]
    fn error_report_keeps_original_body() {
        let report = StatusError::invalid_configuration("expected value", b"{oops");
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"error": {
                "message": "Invalid JSON received for configuration",
                "details": "expected value",
                "original": "{oops"
            }})
        );
    }
}
