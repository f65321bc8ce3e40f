// Copyright (C) 2026 The Allocator Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const ENVELOPE_VERSION: &str = "1.0";
pub const REQUEST_TYPE: &str = "allocation-request";
pub const RESULT_TYPE: &str = "allocation-result";

/// Annotation key on a GameServer holding the comma-separated routing tokens
/// consumed by the UDP proxy.
pub const TOKENS_ANNOTATION: &str = "quilkin.dev/tokens";

const TOKEN_SIZE: usize = 16;

pub type PlayerId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AllocationStatus {
    Success,
    Failure,
    Queued,
}

impl AllocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Queued => "Queued",
        }
    }
}

/// Allocation request envelope as published by matchmaking.
///
/// `kind` carries the optional envelope `type` field; shared topics may see
/// foreign traffic, which the transport drops when the type does not match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    #[serde(default)]
    pub ticket_id: String,
    #[serde(default)]
    pub fleet: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub player_id: PlayerId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub join_on_ids: Vec<PlayerId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub can_join_not_found: bool,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub envelope_version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ticket_id: String,
    pub status: AllocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
}

impl AllocationResult {
    fn envelope(ticket_id: &str, status: AllocationStatus) -> Self {
        Self {
            envelope_version: ENVELOPE_VERSION.to_string(),
            kind: RESULT_TYPE.to_string(),
            ticket_id: ticket_id.to_string(),
            status,
            token: None,
            error_message: None,
            queue_position: None,
            queue_id: None,
        }
    }

    pub fn success(ticket_id: &str, token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            ..Self::envelope(ticket_id, AllocationStatus::Success)
        }
    }

    pub fn failure(ticket_id: &str, message: &str) -> Self {
        Self {
            error_message: Some(message.to_string()),
            ..Self::envelope(ticket_id, AllocationStatus::Failure)
        }
    }

    pub fn queued(ticket_id: &str, queue_id: &str, position: usize) -> Self {
        Self {
            queue_position: Some(position),
            queue_id: Some(queue_id.to_string()),
            ..Self::envelope(ticket_id, AllocationStatus::Queued)
        }
    }
}

/// Derive the 16-byte routing token for a player id.
///
/// The id bytes are truncated or zero-padded to exactly 16 bytes, then
/// base64-encoded with the standard alphabet. Two ids sharing their first 16
/// bytes collide; the derivation keeps that behavior but flags it.
pub fn routing_token(player_id: &str) -> String {
    let mut buf = [0u8; TOKEN_SIZE];
    let bytes = player_id.as_bytes();
    if bytes.len() > TOKEN_SIZE {
        warn!(
            player_id_len = bytes.len(),
            "player id exceeds 16 bytes; routing token is truncated and may collide"
        );
    }
    let n = bytes.len().min(TOKEN_SIZE);
    buf[..n].copy_from_slice(&bytes[..n]);
    BASE64.encode(buf)
}

/// Parsed view of the comma-separated token-set annotation.
///
/// All reads and writes of the annotation go through this type; `append` and
/// `remove` are the only mutators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    tokens: Vec<String>,
}

impl TokenSet {
    /// Split on commas, trimming ASCII whitespace and dropping empty elements.
    pub fn parse(raw: &str) -> Self {
        let tokens = raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        Self { tokens }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Canonical wire form: comma-joined, no whitespace, no empty elements.
    pub fn render(&self) -> String {
        self.tokens.join(",")
    }

    /// Add `token` to the raw annotation value, idempotently.
    ///
    /// When the token is already present the input is returned verbatim, so
    /// whitespace written by third parties survives a no-op append.
    pub fn append(existing: &str, token: &str) -> String {
        if Self::parse(existing).contains(token) {
            return existing.to_string();
        }
        if existing.is_empty() {
            token.to_string()
        } else {
            format!("{existing},{token}")
        }
    }

    /// Remove every occurrence of `token`, rendering canonically.
    pub fn remove(existing: &str, token: &str) -> String {
        let mut set = Self::parse(existing);
        set.tokens.retain(|t| t != token);
        set.render()
    }
}
