use std::time::Duration;

use playground_proto::{COMMAND_PATH, Command, CommandReply, DisplayItem};

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The instance answered and refused; the text is the instance's own.
    #[error("{0}")]
    Remote(String),
    #[error("send {command} to 127.0.0.1:{port}")]
    Transport {
        command: &'static str,
        port: u16,
        #[source]
        source: reqwest::Error,
    },
    #[error("timed out sending {command} to 127.0.0.1:{port}")]
    Timeout { command: &'static str, port: u16 },
    #[error("decode {command} reply")]
    Decode {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Posts one command and returns the reply message of a successful reply.
pub async fn send_command(
    port: u16,
    command: &Command,
    timeout: Duration,
) -> Result<Option<String>, ClientError> {
    let name = command.kind.as_str();
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(timeout)
        .build()
        .map_err(|source| ClientError::Transport {
            command: name,
            port,
            source,
        })?;
    let transport = |source: reqwest::Error| {
        if source.is_timeout() {
            ClientError::Timeout {
                command: name,
                port,
            }
        } else {
            ClientError::Transport {
                command: name,
                port,
                source,
            }
        }
    };
    let resp = client
        .post(format!("http://127.0.0.1:{port}{COMMAND_PATH}"))
        .json(command)
        .send()
        .await
        .map_err(transport)?;
    let status = resp.status();
    let body = resp.bytes().await.map_err(transport)?;
    let reply: CommandReply = match serde_json::from_slice(&body) {
        Ok(reply) => reply,
        Err(_) if !status.is_success() => {
            return Err(ClientError::Remote(format!(
                "{status}: {}",
                String::from_utf8_lossy(&body).trim()
            )));
        }
        Err(source) => {
            return Err(ClientError::Decode {
                command: name,
                source,
            });
        }
    };
    if !reply.ok {
        let msg = reply
            .error
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| format!("{name} failed"));
        return Err(ClientError::Remote(msg));
    }
    Ok(reply.message)
}

pub async fn fetch_display(port: u16, timeout: Duration) -> Result<Vec<DisplayItem>, ClientError> {
    let msg = send_command(port, &Command::display(), timeout).await?;
    let raw = msg.unwrap_or_default();
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).map_err(|source| ClientError::Decode {
        command: "display",
        source,
    })
}
