use std::{fmt, time::Duration};

use playground_proto::{COMMAND_PATH, CommandReply, METHOD_NOT_ALLOWED, PING_PATH, PONG};
use reqwest::StatusCode;

/// Result of asking a port whether a command server is behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive,
    Refused,
    TimedOut,
    Unexpected(String),
}

impl ProbeOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alive => f.write_str("alive"),
            Self::Refused => f.write_str("connection refused"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Unexpected(reason) => f.write_str(reason),
        }
    }
}

/// Probes `127.0.0.1:port` within `timeout`.
///
/// `GET /ping` must answer `{ok:true,message:"pong"}`. Servers without that
/// endpoint are recognised by `GET /command` answering 405 with the
/// method-not-allowed reply.
pub async fn probe_liveness(port: u16, timeout: Duration) -> ProbeOutcome {
    match tokio::time::timeout(timeout, probe_inner(port, timeout)).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::TimedOut,
    }
}

async fn probe_inner(port: u16, timeout: Duration) -> ProbeOutcome {
    let client = match reqwest::Client::builder()
        .no_proxy()
        .timeout(timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => return ProbeOutcome::Unexpected(format!("build http client: {e}")),
    };
    let base = format!("http://127.0.0.1:{port}");

    match client.get(format!("{base}{PING_PATH}")).send().await {
        Ok(resp) if resp.status() == StatusCode::OK => {
            return match resp.json::<CommandReply>().await {
                Ok(reply) if reply.ok && reply.message.as_deref() == Some(PONG) => {
                    ProbeOutcome::Alive
                }
                Ok(_) => ProbeOutcome::Unexpected("unexpected probe response".to_string()),
                Err(e) if e.is_timeout() => ProbeOutcome::TimedOut,
                Err(e) => ProbeOutcome::Unexpected(format!("unexpected probe response: {e}")),
            };
        }
        Ok(_) => {}
        Err(e) => match classify(&e) {
            ProbeOutcome::Unexpected(_) => {}
            outcome => return outcome,
        },
    }

    let resp = match client.get(format!("{base}{COMMAND_PATH}")).send().await {
        Ok(resp) => resp,
        Err(e) => return classify(&e),
    };
    let status = resp.status();
    if status != StatusCode::METHOD_NOT_ALLOWED {
        return ProbeOutcome::Unexpected(format!("unexpected probe status {status}"));
    }
    match resp.json::<CommandReply>().await {
        Ok(reply) if !reply.ok && reply.error.as_deref() == Some(METHOD_NOT_ALLOWED) => {
            ProbeOutcome::Alive
        }
        Ok(_) => ProbeOutcome::Unexpected("unexpected probe response".to_string()),
        Err(e) if e.is_timeout() => ProbeOutcome::TimedOut,
        Err(e) => ProbeOutcome::Unexpected(format!("unexpected probe response: {e}")),
    }
}

fn classify(err: &reqwest::Error) -> ProbeOutcome {
    if err.is_timeout() {
        return ProbeOutcome::TimedOut;
    }
    if is_connection_refused(err) || err.is_connect() {
        return ProbeOutcome::Refused;
    }
    ProbeOutcome::Unexpected(err.to_string())
}

fn is_connection_refused(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::ConnectionRefused
        {
            return true;
        }
        cur = e.source();
    }
    false
}
