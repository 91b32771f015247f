//! Last known configuration of the Pingboard
//!
//! Inbound configuration messages are partial updates. `DeviceState` merges
//! them into a full picture of the board so it can be published again on
//! shutdown. Nothing is reported until the first configuration has arrived,
//! which keeps placeholder values off the broker.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::amqp::configuration_channel::ConfigurationHandler;
use crate::amqp::message::{
    BlinkMode, ConfigurationMessage, DeviceConfiguration, KeyBlink, KeyColor, Rgb,
};
use crate::amqp::shutdown::SnapshotProvider;
use crate::config::KEY_COUNT;

pub const DEFAULT_BRIGHTNESS: u8 = 255;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct KeyState {
    color: Rgb,
    blink_mode: BlinkMode,
    blink_color: Rgb,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct BoardState {
    brightness: u8,
    keys: [KeyState; KEY_COUNT],
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            brightness: DEFAULT_BRIGHTNESS,
            keys: Default::default(),
        }
    }
}

impl BoardState {
    fn key_mut(&mut self, idx: u8) -> Option<&mut KeyState> {
        let slot = usize::from(idx).checked_sub(1)?;
        self.keys.get_mut(slot)
    }

    fn as_message(&self) -> ConfigurationMessage {
        let numbered = || (1u8..).zip(self.keys.iter());
        ConfigurationMessage::new(DeviceConfiguration {
            brightness: Some(self.brightness),
            keys: numbered()
                .map(|(idx, key)| KeyColor {
                    idx,
                    color: key.color,
                })
                .collect(),
            blink: numbered()
                .map(|(idx, key)| KeyBlink {
                    idx,
                    mode: key.blink_mode,
                    color: key.blink_color,
                })
                .collect(),
        })
    }
}

/// Shared, thread-safe board state
#[derive(Debug, Default)]
pub struct DeviceState {
    board: RwLock<Option<BoardState>>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a configuration update
    ///
    /// Returns `false` if any entry addressed a key that does not exist; the
    /// remaining entries are still applied.
    pub fn apply(&self, message: &ConfigurationMessage) -> bool {
        let update = &message.configuration;
        let mut guard = self.write();
        let board = guard.get_or_insert_with(|| {
            info!("First configuration received");
            BoardState::default()
        });
        let mut applied = true;

        if let Some(brightness) = update.brightness {
            debug!("Brightness {}", brightness);
            board.brightness = brightness;
        }

        for key in &update.keys {
            match board.key_mut(key.idx) {
                Some(state) => state.color = key.color,
                None => {
                    warn!("Color for unknown key {} ignored", key.idx);
                    applied = false;
                }
            }
        }

        for blink in &update.blink {
            match board.key_mut(blink.idx) {
                Some(state) => {
                    // A single blink is a one-off and must not be replayed.
                    state.blink_mode = match blink.mode {
                        BlinkMode::Single => BlinkMode::Off,
                        mode => mode,
                    };
                    state.blink_color = blink.color;
                }
                None => {
                    warn!("Blink for unknown key {} ignored", blink.idx);
                    applied = false;
                }
            }
        }

        applied
    }

    /// Handler that feeds inbound configuration into this state
    pub fn handler(self: &Arc<Self>) -> impl ConfigurationHandler {
        let state = self.clone();
        move |message: ConfigurationMessage| state.apply(&message)
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<BoardState>> {
        self.board.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<BoardState>> {
        self.board.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotProvider for DeviceState {
    fn snapshot(&self) -> Option<ConfigurationMessage> {
        self.read().as_ref().map(BoardState::as_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(value: serde_json::Value) -> ConfigurationMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn no_snapshot_before_first_configuration() {
        assert_eq!(DeviceState::new().snapshot(), None);
    }

    #[test]
    fn partial_update_fills_in_defaults() {
        let state = DeviceState::new();
        assert!(state.apply(&message(json!({"configuration": {
            "keys": [{"idx": 2, "color": [10, 20, 30]}]
        }}))));

        let snapshot = serde_json::to_value(state.snapshot().unwrap()).unwrap();
        assert_eq!(
            snapshot,
            json!({"configuration": {
                "brightness": 255,
                "keys": [
                    {"idx": 1, "color": [0, 0, 0]},
                    {"idx": 2, "color": [10, 20, 30]},
                    {"idx": 3, "color": [0, 0, 0]},
                    {"idx": 4, "color": [0, 0, 0]},
                ],
                "blink": [
                    {"idx": 1, "mode": "OFF", "color": [0, 0, 0]},
                    {"idx": 2, "mode": "OFF", "color": [0, 0, 0]},
                    {"idx": 3, "mode": "OFF", "color": [0, 0, 0]},
                    {"idx": 4, "mode": "OFF", "color": [0, 0, 0]},
                ],
            }})
        );
    }

    #[test]
    fn updates_merge() {
        let state = DeviceState::new();
        state.apply(&message(json!({"configuration": {"brightness": 40}})));
        state.apply(&message(json!({"configuration": {
            "blink": [{"idx": 4, "mode": "LONG", "color": [1, 2, 3]}]
        }})));

        let configuration = state.snapshot().unwrap().configuration;
        assert_eq!(configuration.brightness, Some(40));
        assert_eq!(configuration.blink[3].mode, BlinkMode::Long);
        assert_eq!(configuration.blink[3].color, [1, 2, 3]);
    }

    #[test]
    fn single_blink_is_not_replayed() {
        let state = DeviceState::new();
        state.apply(&message(json!({"configuration": {
            "blink": [{"idx": 1, "mode": "SINGLE", "color": [255, 0, 0]}]
        }})));

        let blink = &state.snapshot().unwrap().configuration.blink[0];
        assert_eq!(blink.mode, BlinkMode::Off);
        assert_eq!(blink.color, [255, 0, 0]);
    }

    #[test]
    fn unknown_keys_are_reported() {
        let state = DeviceState::new();
        let applied = state.apply(&message(json!({"configuration": {
            "brightness": 7,
            "keys": [{"idx": 0, "color": [1, 1, 1]}, {"idx": 5, "color": [1, 1, 1]}]
        }})));

        assert!(!applied);
        assert_eq!(state.snapshot().unwrap().configuration.brightness, Some(7));
    }

    #[test]
    fn handler_applies_to_shared_state() {
        let state = Arc::new(DeviceState::new());
        let mut handler = state.handler();

        assert!(handler.on_configuration(message(json!({"configuration": {"brightness": 1}}))));
        assert_eq!(state.snapshot().unwrap().configuration.brightness, Some(1));
    }
}
