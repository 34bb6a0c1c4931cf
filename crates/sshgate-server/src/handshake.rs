//! Connection handshake.
//!
//! The browser opens the gateway socket with the SSH target in the URL query:
//! `/?host=example.org&port=22&user=alice&password=...`. Nothing else is
//! exchanged before the remote session is opened.

use sshgate_core::{GateError, GateResult};
use std::fmt;
use url::form_urlencoded;

const DEFAULT_SSH_PORT: u16 = 22;

/// Target and credentials for one remote session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ConnectParams {
    /// Parse the query string of the upgrade request (without the leading `?`).
    pub fn from_query(query: &str) -> GateResult<Self> {
        let mut host = None;
        let mut port = None;
        let mut user = None;
        let mut password = None;

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "host" => host = Some(value.into_owned()),
                "port" => port = Some(value.into_owned()),
                "user" => user = Some(value.into_owned()),
                "password" => password = Some(value.into_owned()),
                _ => {}
            }
        }

        let host = required("host", host)?;
        let user = required("user", user)?;
        let password = password
            .ok_or_else(|| GateError::ConnectFailed("missing `password` parameter".into()))?;

        let port = match port.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_SSH_PORT,
            Some(raw) => match raw.parse::<u16>() {
                Ok(p) if p > 0 => p,
                _ => {
                    return Err(GateError::ConnectFailed(format!("invalid port: {raw}")));
                }
            },
        };

        Ok(Self {
            host,
            port,
            user,
            password,
        })
    }

    /// `user@host:port`, for logs.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

fn required(name: &str, value: Option<String>) -> GateResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(GateError::ConnectFailed(format!(
            "missing `{name}` parameter"
        ))),
    }
}
