//! Wire entities shared by the daemon command server and its clients.

use std::{fmt, str::FromStr};

use serde::Deserialize;

pub const PING_PATH: &str = "/ping";
pub const COMMAND_PATH: &str = "/command";
pub const MAX_COMMAND_BODY_BYTES: usize = 1 << 20;

pub const PONG: &str = "pong";
pub const METHOD_NOT_ALLOWED: &str = "method not allowed";
pub const INVALID_JSON_PAYLOAD: &str = "invalid JSON payload";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    Display,
    Stop,
    ScaleIn,
    ScaleOut,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Display => "display",
            Self::Stop => "stop",
            Self::ScaleIn => "scale-in",
            Self::ScaleOut => "scale-out",
        }
    }
}

/// Body of `POST /command`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Command {
    fn bare(kind: CommandType) -> Self {
        Self {
            kind,
            service: None,
            count: None,
            name: None,
            pid: None,
            version: None,
        }
    }

    pub fn display() -> Self {
        Self::bare(CommandType::Display)
    }

    pub fn stop() -> Self {
        Self::bare(CommandType::Stop)
    }

    pub fn scale_out(service: ServiceKind, count: u32, version: Option<String>) -> Self {
        Self {
            service: Some(service.as_str().to_string()),
            count: Some(count),
            version,
            ..Self::bare(CommandType::ScaleOut)
        }
    }

    pub fn scale_in_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::bare(CommandType::ScaleIn)
        }
    }

    pub fn scale_in_pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Self::bare(CommandType::ScaleIn)
        }
    }
}

/// Strict decode: unknown fields and anything after the JSON value are rejected.
pub fn decode_command(body: &[u8]) -> Result<Command, String> {
    let mut de = serde_json::Deserializer::from_slice(body);
    let cmd = Command::deserialize(&mut de).map_err(|e| e.to_string())?;
    de.end().map_err(|_| INVALID_JSON_PAYLOAD.to_string())?;
    Ok(cmd)
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommandReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            ok: true,
            message: None,
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Pd,
    Tikv,
    Tidb,
    Tiflash,
    Tiproxy,
}

impl ServiceKind {
    /// Boot order: placement first, storage, then the stateless layers.
    pub const ALL: [ServiceKind; 5] = [
        ServiceKind::Pd,
        ServiceKind::Tikv,
        ServiceKind::Tidb,
        ServiceKind::Tiflash,
        ServiceKind::Tiproxy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pd => "pd",
            Self::Tikv => "tikv",
            Self::Tidb => "tidb",
            Self::Tiflash => "tiflash",
            Self::Tiproxy => "tiproxy",
        }
    }

    pub fn binary_name(self) -> &'static str {
        match self {
            Self::Pd => "pd-server",
            Self::Tikv => "tikv-server",
            Self::Tidb => "tidb-server",
            Self::Tiflash => "tiflash",
            Self::Tiproxy => "tiproxy",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| format!("unknown service {s:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Exited,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Exited => "exited",
            Self::Failed => "failed",
        }
    }
}

/// One row of the `display` reply; the reply message is a JSON array of these.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DisplayItem {
    pub name: String,
    pub service_id: ServiceKind,
    #[serde(default)]
    pub pid: Option<u32>,
    pub status: ServiceStatus,
    pub version: String,
}
