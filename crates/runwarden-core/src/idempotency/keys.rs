// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotency key schemes, one per trigger source.
//!
//! | Source | Key shape |
//! |--------|-----------|
//! | webhook | `webhook:{delivery_id}` |
//! | api | `api:{client_id}:{request_id}` |
//! | chat command | `chat:{team_id}:{trigger_id}` |
//! | scheduler | `scheduler:{schedule_id}:{execution_slot}` |
//!
//! Only the last component may contain `:` (scheduler slots are RFC 3339
//! timestamps), so every key parses back into the input that produced it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LENGTH: usize = 512;

/// Where a trigger came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Provider webhook delivery.
    Webhook,
    /// Direct API call.
    Api,
    /// Chat slash command.
    ChatCommand,
    /// Scheduled execution.
    Scheduler,
}

impl TriggerSource {
    /// Returns the string representation of the source.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Api => "api",
            Self::ChatCommand => "chat_command",
            Self::Scheduler => "scheduler",
        }
    }

    /// Key prefix used by this source's scheme.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Api => "api",
            Self::ChatCommand => "chat",
            Self::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "webhook" => Ok(Self::Webhook),
            "api" => Ok(Self::Api),
            "chat_command" => Ok(Self::ChatCommand),
            "scheduler" => Ok(Self::Scheduler),
            other => Err(CoreError::validation(
                "source",
                format!("unknown trigger source '{other}'"),
            )),
        }
    }
}

/// Typed input a trigger adapter supplies to derive an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum IdempotencyKeyInput {
    /// Provider-issued delivery UUID.
    Webhook {
        /// Delivery id header value.
        delivery_id: String,
    },
    /// Caller-supplied request id scoped per client.
    Api {
        /// Calling client.
        client_id: String,
        /// Request id chosen by the client.
        request_id: String,
    },
    /// Chat provider trigger id.
    ChatCommand {
        /// Workspace/team id.
        team_id: String,
        /// Provider trigger id.
        trigger_id: String,
    },
    /// Schedule id plus the truncated execution slot.
    Scheduler {
        /// Schedule definition id.
        schedule_id: String,
        /// Slot produced by [`scheduler_execution_slot`].
        execution_slot: String,
    },
}

impl IdempotencyKeyInput {
    /// Trigger source of this input.
    pub fn source(&self) -> TriggerSource {
        match self {
            Self::Webhook { .. } => TriggerSource::Webhook,
            Self::Api { .. } => TriggerSource::Api,
            Self::ChatCommand { .. } => TriggerSource::ChatCommand,
            Self::Scheduler { .. } => TriggerSource::Scheduler,
        }
    }

    /// The source-specific correlation id (last key component).
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Webhook { delivery_id } => delivery_id,
            Self::Api { request_id, .. } => request_id,
            Self::ChatCommand { trigger_id, .. } => trigger_id,
            Self::Scheduler { execution_slot, .. } => execution_slot,
        }
    }
}

fn check_component(field: &str, value: &str, last: bool) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(field, "must not be empty"));
    }
    if !last && value.contains(':') {
        return Err(CoreError::validation(field, "must not contain ':'"));
    }
    Ok(())
}

/// Build the idempotency key for a trigger.
pub fn generate_idempotency_key(input: &IdempotencyKeyInput) -> Result<String> {
    let prefix = input.source().key_prefix();
    let key = match input {
        IdempotencyKeyInput::Webhook { delivery_id } => {
            check_component("delivery_id", delivery_id, true)?;
            format!("{prefix}:{delivery_id}")
        }
        IdempotencyKeyInput::Api {
            client_id,
            request_id,
        } => {
            check_component("client_id", client_id, false)?;
            check_component("request_id", request_id, true)?;
            format!("{prefix}:{client_id}:{request_id}")
        }
        IdempotencyKeyInput::ChatCommand {
            team_id,
            trigger_id,
        } => {
            check_component("team_id", team_id, false)?;
            check_component("trigger_id", trigger_id, true)?;
            format!("{prefix}:{team_id}:{trigger_id}")
        }
        IdempotencyKeyInput::Scheduler {
            schedule_id,
            execution_slot,
        } => {
            check_component("schedule_id", schedule_id, false)?;
            check_component("execution_slot", execution_slot, true)?;
            format!("{prefix}:{schedule_id}:{execution_slot}")
        }
    };

    validate_key_length(&key)?;
    Ok(key)
}

fn validate_key_length(key: &str) -> Result<()> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(CoreError::validation(
            "key",
            format!("exceeds {MAX_KEY_LENGTH} bytes"),
        ));
    }
    Ok(())
}

/// Parse a key back into the input that produced it.
pub fn parse_idempotency_key(key: &str) -> Result<IdempotencyKeyInput> {
    validate_key_length(key)?;
    let invalid = || CoreError::validation("key", format!("malformed idempotency key '{key}'"));

    let (prefix, rest) = key.split_once(':').ok_or_else(invalid)?;
    let input = match prefix {
        "webhook" => IdempotencyKeyInput::Webhook {
            delivery_id: rest.to_string(),
        },
        "api" => {
            let (client_id, request_id) = rest.split_once(':').ok_or_else(invalid)?;
            IdempotencyKeyInput::Api {
                client_id: client_id.to_string(),
                request_id: request_id.to_string(),
            }
        }
        "chat" => {
            let (team_id, trigger_id) = rest.split_once(':').ok_or_else(invalid)?;
            IdempotencyKeyInput::ChatCommand {
                team_id: team_id.to_string(),
                trigger_id: trigger_id.to_string(),
            }
        }
        "scheduler" => {
            let (schedule_id, execution_slot) = rest.split_once(':').ok_or_else(invalid)?;
            IdempotencyKeyInput::Scheduler {
                schedule_id: schedule_id.to_string(),
                execution_slot: execution_slot.to_string(),
            }
        }
        _ => return Err(invalid()),
    };

    // Reject empty components the generator would never emit.
    generate_idempotency_key(&input).map_err(|_| invalid())?;
    Ok(input)
}

/// Truncate `at` to the start of its slot and render it as the key component.
///
/// A zero granularity keeps second precision.
pub fn scheduler_execution_slot(at: DateTime<Utc>, granularity: Duration) -> String {
    let step = i64::try_from(granularity.as_secs().max(1)).unwrap_or(i64::MAX);
    let truncated = at.timestamp().div_euclid(step) * step;
    DateTime::from_timestamp(truncated, 0)
        .unwrap_or(at)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// SHA-256 hex digest of the canonical JSON form of a request payload.
///
/// `serde_json` keeps object keys sorted, so equal payloads hash equally
/// regardless of the order their fields were supplied in.
pub fn hash_request(payload: &serde_json::Value) -> String {
    let canonical = payload.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn all_inputs() -> Vec<IdempotencyKeyInput> {
        vec![
            IdempotencyKeyInput::Webhook {
                delivery_id: "72d3162e-cc78-11e3-81ab-4c9367dc0958".to_string(),
            },
            IdempotencyKeyInput::Api {
                client_id: "client-1".to_string(),
                request_id: "req:with:colons".to_string(),
            },
            IdempotencyKeyInput::ChatCommand {
                team_id: "T012AB3C4".to_string(),
                trigger_id: "13345224609.738474920.8088930838d88f008e0".to_string(),
            },
            IdempotencyKeyInput::Scheduler {
                schedule_id: "nightly-triage".to_string(),
                execution_slot: "2025-03-01T02:00:00Z".to_string(),
            },
        ]
    }

    #[test]
    fn test_key_shapes() {
        let keys: Vec<String> = all_inputs()
            .iter()
            .map(|input| generate_idempotency_key(input).unwrap())
            .collect();
        assert_eq!(keys[0], "webhook:72d3162e-cc78-11e3-81ab-4c9367dc0958");
        assert_eq!(keys[1], "api:client-1:req:with:colons");
        assert_eq!(keys[2], "chat:T012AB3C4:13345224609.738474920.8088930838d88f008e0");
        assert_eq!(keys[3], "scheduler:nightly-triage:2025-03-01T02:00:00Z");
    }

    #[test]
    fn test_parse_inverts_generate_for_every_scheme() {
        for input in all_inputs() {
            let key = generate_idempotency_key(&input).unwrap();
            assert_eq!(parse_idempotency_key(&key).unwrap(), input);
        }
    }

    #[test]
    fn test_generate_rejects_bad_components() {
        let empty = IdempotencyKeyInput::Webhook {
            delivery_id: "  ".to_string(),
        };
        assert!(generate_idempotency_key(&empty).is_err());

        let colon = IdempotencyKeyInput::Api {
            client_id: "a:b".to_string(),
            request_id: "r".to_string(),
        };
        let err = generate_idempotency_key(&colon).unwrap_err();
        assert!(err.to_string().contains("client_id"));

        let long = IdempotencyKeyInput::Webhook {
            delivery_id: "x".repeat(MAX_KEY_LENGTH),
        };
        assert!(generate_idempotency_key(&long).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        for key in ["", "webhook", "webhook:", "api:only-client", "ftp:abc", "chat::t"] {
            assert!(parse_idempotency_key(key).is_err(), "{key:?} should fail");
        }
    }

    #[test]
    fn test_scheduler_slot_truncation() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 2, 7, 45).unwrap();
        assert_eq!(
            scheduler_execution_slot(at, Duration::from_secs(300)),
            "2025-03-01T02:05:00Z"
        );
        assert_eq!(
            scheduler_execution_slot(at, Duration::from_secs(3600)),
            "2025-03-01T02:00:00Z"
        );
        assert_eq!(
            scheduler_execution_slot(at, Duration::ZERO),
            "2025-03-01T02:07:45Z"
        );
        // Granularities past i64 seconds clamp into one slot at the epoch.
        assert_eq!(
            scheduler_execution_slot(at, Duration::from_secs(u64::MAX)),
            "1970-01-01T00:00:00Z"
        );
    }

    #[test]
    fn test_hash_request_is_order_independent() {
        let a = json!({"action": "opened", "number": 7});
        let b = json!({"number": 7, "action": "opened"});
        assert_eq!(hash_request(&a), hash_request(&b));
        assert_ne!(hash_request(&a), hash_request(&json!({"action": "closed"})));
        assert_eq!(hash_request(&a).len(), 64);
    }

    #[test]
    fn test_source_strings() {
        for input in all_inputs() {
            let source = input.source();
            assert_eq!(source.as_str().parse::<TriggerSource>().unwrap(), source);
        }
    }
}
