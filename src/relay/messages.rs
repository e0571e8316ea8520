use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Push message types the relay republishes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Leaderboard,
    Vault,
    Market,
}

impl UpdateKind {
    pub const ALL: [UpdateKind; 3] = [UpdateKind::Leaderboard, UpdateKind::Vault, UpdateKind::Market];

    /// `type` field on the wire
    pub fn wire_type(&self) -> &'static str {
        match self {
            UpdateKind::Leaderboard => "leaderboard_update",
            UpdateKind::Vault => "vault_update",
            UpdateKind::Market => "market_update",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "leaderboard_update" => Some(UpdateKind::Leaderboard),
            "vault_update" => Some(UpdateKind::Vault),
            "market_update" => Some(UpdateKind::Market),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RelayUpdate {
    pub kind: UpdateKind,
    pub channel: Option<String>,
    /// Whole inbound message
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Outbound `{type, channel}` request
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelRequest {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub channel: String,
}

impl ChannelRequest {
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self {
            msg_type: "subscribe",
            channel: channel.into(),
        }
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self {
            msg_type: "unsubscribe",
            channel: channel.into(),
        }
    }
}

pub fn league_channel(league_id: &str) -> String {
    format!("league:{}", league_id)
}

pub fn vault_channel(vault_id: &str) -> String {
    format!("vault:{}", vault_id)
}

pub fn market_channel(market_id: &str) -> String {
    format!("market:{}", market_id)
}

/// Parse one inbound text frame. `Ok(None)` for well-formed messages of
/// other types (pong, acks).
pub fn parse_update(text: &str) -> Result<Option<RelayUpdate>, serde_json::Error> {
    let payload: Value = serde_json::from_str(text)?;

    let Some(kind) = payload
        .get("type")
        .and_then(|v| v.as_str())
        .and_then(UpdateKind::from_wire)
    else {
        return Ok(None);
    };

    let channel = payload
        .get("channel")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(Some(RelayUpdate {
        kind,
        channel,
        payload,
        received_at: Utc::now(),
    }))
}
