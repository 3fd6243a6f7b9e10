//! Session configuration assembly.
//!
//! A [`SessionBuilder`] is a plain struct populated field by field;
//! [`SessionBuilder::build`] validates the required pieces, parses the raw
//! stream parameters, and constructs the session. The decoder is passed at
//! build time because trait objects have no useful default.

use std::time::Duration;

use tracing::warn;

use crate::client::session::SessionConfig;
use crate::client::ReplicationSession;
use crate::config::{ConnectionConfig, DEFAULT_STATUS_INTERVAL};
use crate::decoder::{MessageDecoder, Plugin};
use crate::error::{Error, Result};

/// Slot names are restricted server-side to 63 bytes.
const MAX_SLOT_NAME_LEN: usize = 63;

/// Configuration for a [`ReplicationSession`].
///
/// ```no_run
/// use pg_logical_replication::{PgOutputDecoder, Plugin, SessionBuilder};
///
/// # async fn example() -> pg_logical_replication::Result<()> {
/// let mut builder = SessionBuilder::default();
/// builder.slot_name = "dbz_test".into();
/// builder.plugin = Some(Plugin::Pgoutput);
/// builder.drop_slot_on_close = false;
///
/// let session = builder
///     .build(Box::new(PgOutputDecoder::new("my_publication")))
///     .await?;
/// # let _ = session;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    pub connection: ConnectionConfig,

    /// Name of the server slot to attach. Required.
    pub slot_name: String,

    /// Output-plugin identity. Required; must match the decoder passed to
    /// [`build`](Self::build).
    pub plugin: Option<Plugin>,

    /// Drop the slot when the session closes. On servers that support it
    /// this turns into a temporary slot the server reaps by itself.
    pub drop_slot_on_close: bool,

    /// Period of unsolicited status updates; zero disables them.
    pub status_update_interval: Duration,

    /// Raw `k1=v1;k2=v2` options forwarded to the plugin at stream start.
    /// Malformed entries are skipped with a warning, never fatal.
    pub stream_params: String,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            slot_name: String::new(),
            plugin: None,
            drop_slot_on_close: false,
            status_update_interval: DEFAULT_STATUS_INTERVAL,
            stream_params: String::new(),
        }
    }
}

impl SessionBuilder {
    /// Validate the configuration and construct the session.
    pub async fn build(self, decoder: Box<dyn MessageDecoder>) -> Result<ReplicationSession> {
        let plugin = self
            .plugin
            .ok_or_else(|| Error::Config("decoding plugin is not set".into()))?;
        validate_slot_name(&self.slot_name)?;

        let config = SessionConfig {
            connection: self.connection,
            slot_name: self.slot_name,
            plugin,
            drop_slot_on_close: self.drop_slot_on_close,
            status_update_interval: self.status_update_interval,
            stream_params: parse_stream_params(&self.stream_params),
        };
        ReplicationSession::connect(config, decoder).await
    }
}

fn validate_slot_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("slot name is required".into()));
    }
    if name.len() > MAX_SLOT_NAME_LEN {
        return Err(Error::Config(format!(
            "slot name exceeds {MAX_SLOT_NAME_LEN} bytes: '{name}'"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(Error::Config(format!(
            "slot name may only contain lower-case letters, digits and underscores: '{name}'"
        )));
    }
    Ok(())
}

/// Parse `k1=v1;k2=v2` stream parameters. Entries that do not split into
/// exactly a key and a value are dropped with a warning.
pub(crate) fn parse_stream_params(raw: &str) -> Vec<(String, String)> {
    if raw.is_empty() {
        return Vec::new();
    }
    let mut params = Vec::new();
    for pair in raw.split(';') {
        let parts: Vec<&str> = pair.split('=').collect();
        if parts.len() == 2 {
            params.push((parts[0].to_string(), parts[1].to_string()));
        } else {
            warn!("invalid stream parameter, skipping: '{pair}'");
        }
    }
    params
}
