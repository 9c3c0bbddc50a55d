//! Codec for the CI state record persisted in a pool instance's free-text
//! tag annotation.
//!
//! The annotation is the sole persistence layer for reservation state: a
//! comma-separated list of `field:value` pairs, written back to the instance
//! through its host and re-read on every inventory refresh. The format is
//! untyped text; the only coercion applied on decode is the literal
//! `True`/`False` spelling, which maps to a boolean.

use serde::{Deserialize, Serialize};

/// Live power state of a pool instance, as reported by its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerStatus {
    PoweredOn,
    PoweredOff,
    Unknown,
}

impl PowerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerStatus::PoweredOn => "poweredOn",
            PowerStatus::PoweredOff => "poweredOff",
            PowerStatus::Unknown => "unknown",
        }
    }

    /// Any unrecognized spelling decodes as [`PowerStatus::Unknown`].
    pub fn parse(raw: &str) -> PowerStatus {
        match raw {
            "poweredOn" => PowerStatus::PoweredOn,
            "poweredOff" => PowerStatus::PoweredOff,
            _ => PowerStatus::Unknown,
        }
    }
}

/// A single tag field value: either a boolean (spelled `True`/`False` on the
/// wire) or free text such as an owner token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
    Bool(bool),
    Text(String),
}

impl TagValue {
    fn render(&self) -> String {
        match self {
            TagValue::Bool(true) => "True".to_string(),
            TagValue::Bool(false) => "False".to_string(),
            TagValue::Text(text) => text.clone(),
        }
    }

    fn parse(raw: &str) -> TagValue {
        match raw {
            "True" => TagValue::Bool(true),
            "False" => TagValue::Bool(false),
            _ => TagValue::Text(raw.to_string()),
        }
    }

    /// A reservation field is free iff it holds the literal `False`.
    pub fn is_free(&self) -> bool {
        matches!(self, TagValue::Bool(false))
    }

    /// The owner token, for a reservation field holding one.
    pub fn owner(&self) -> Option<&str> {
        match self {
            TagValue::Text(owner) => Some(owner),
            TagValue::Bool(_) => None,
        }
    }
}

/// CI-related state of a pool instance.
///
/// `in_ci_use` is the reservation field: `Bool(false)` means free, `Text(..)`
/// carries the owner token (conventionally the requesting controller's
/// hostname), and a bare `Bool(true)` is reserved without a recorded owner. `power_status` is also written into the annotation, but readers
/// overwrite it from the live runtime state on refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub power_status: PowerStatus,
    pub in_ci_use: TagValue,
}

impl Default for State {
    fn default() -> State {
        State {
            power_status: PowerStatus::Unknown,
            in_ci_use: TagValue::Bool(false),
        }
    }
}

/// Serializes every field of `state` into the annotation format.
pub fn encode(state: &State) -> String {
    format!(
        "power_status:{},in_ci_use:{}",
        state.power_status.as_str(),
        state.in_ci_use.render()
    )
}

/// Parses `annotation` into `state`.
///
/// Blank segments are skipped, segments without a `:` separator and unknown
/// field names are ignored, and fields not mentioned keep their current
/// value. A malformed or empty annotation therefore leaves `state` untouched
/// rather than erroring.
pub fn decode(annotation: &str, state: &mut State) {
    for segment in annotation.split(',') {
        if segment.is_empty() {
            continue;
        }
        let Some((field, value)) = segment.split_once(':') else {
            continue;
        };
        match field {
            "power_status" => state.power_status = PowerStatus::parse(value),
            "in_ci_use" => state.in_ci_use = TagValue::parse(value),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_state() {
        let state = State {
            power_status: PowerStatus::PoweredOn,
            in_ci_use: TagValue::Text("controller-1.example.com".to_string()),
        };
        let mut decoded = State::default();
        decode(&encode(&state), &mut decoded);
        assert_eq!(decoded, state);
    }

    #[test]
    fn booleans_keep_their_spelling() {
        let free = State {
            power_status: PowerStatus::PoweredOff,
            in_ci_use: TagValue::Bool(false),
        };
        assert_eq!(encode(&free), "power_status:poweredOff,in_ci_use:False");

        let held = State {
            power_status: PowerStatus::PoweredOn,
            in_ci_use: TagValue::Bool(true),
        };
        assert!(encode(&held).ends_with("in_ci_use:True"));

        let mut decoded = State::default();
        decode("in_ci_use:True", &mut decoded);
        assert_eq!(decoded.in_ci_use, TagValue::Bool(true));
    }

    #[test]
    fn blank_and_unknown_fields_are_tolerated() {
        let mut state = State {
            power_status: PowerStatus::PoweredOn,
            in_ci_use: TagValue::Text("owner".to_string()),
        };
        let before = state.clone();

        decode("", &mut state);
        assert_eq!(state, before);

        decode(",,no-separator,custom_field:whatever,", &mut state);
        assert_eq!(state, before);
    }

    #[test]
    fn unmentioned_fields_keep_their_value() {
        let mut state = State {
            power_status: PowerStatus::PoweredOn,
            in_ci_use: TagValue::Text("owner".to_string()),
        };
        decode("power_status:poweredOff", &mut state);
        assert_eq!(state.power_status, PowerStatus::PoweredOff);
        assert_eq!(state.in_ci_use, TagValue::Text("owner".to_string()));
    }

    #[test]
    fn reservation_helpers() {
        assert!(TagValue::Bool(false).is_free());
        assert!(!TagValue::Bool(true).is_free());
        assert!(!TagValue::Text("ctrl".to_string()).is_free());
        assert_eq!(TagValue::Text("ctrl".to_string()).owner(), Some("ctrl"));
        assert_eq!(TagValue::Bool(false).owner(), None);
    }
}
