//! The decoder seam between the stream and plugin-specific parsing.
//!
//! The stream hands every XLogData payload to a [`MessageDecoder`], which
//! parses it into whatever shape the output plugin produces and calls back
//! into the caller's [`MessageProcessor`]. The client itself never
//! interprets message bodies; the decoders shipped here pass the raw
//! payload through and exist mainly to supply each plugin's
//! `START_REPLICATION` options, including the ones the server may reject
//! on older plugin builds.

use bytes::Bytes;

use crate::error::Result;
use crate::lsn::Lsn;

/// Server-side output plugin identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plugin {
    Pgoutput,
    Wal2Json,
    /// wal2json on RDS-style hosted servers, which reject the metadata
    /// options outright; metadata-less mode is forced unconditionally.
    Wal2JsonRds,
    Decoderbufs,
}

impl Plugin {
    /// Name used in `CREATE_REPLICATION_SLOT` / catalog queries.
    pub fn postgres_plugin_name(&self) -> &'static str {
        match self {
            Plugin::Pgoutput => "pgoutput",
            Plugin::Wal2Json | Plugin::Wal2JsonRds => "wal2json",
            Plugin::Decoderbufs => "decoderbufs",
        }
    }

    /// Hosted variants never get the metadata options, not even as a first
    /// attempt.
    pub fn force_rds(&self) -> bool {
        matches!(self, Plugin::Wal2JsonRds)
    }
}

impl std::fmt::Display for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.postgres_plugin_name())
    }
}

/// Ordered key/value options passed to the plugin at stream start.
///
/// Insertion order is preserved (the server does not care, but logs and
/// tests do); setting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    entries: Vec<(String, String)>,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render the parenthesized option clause of `START_REPLICATION`,
    /// or an empty string when no options are set.
    pub fn to_sql_clause(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let rendered: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("\"{}\" '{}'", k.replace('"', "\"\""), v.replace('\'', "''")))
            .collect();
        format!(" ({})", rendered.join(", "))
    }
}

/// One logical decoding message as delivered to the processor.
///
/// `data` is the plugin payload exactly as it came off the wire; `lsn` is
/// the stream position it was received at.
#[derive(Debug, Clone)]
pub struct LogicalMessage {
    pub lsn: Lsn,
    pub data: Bytes,
}

/// Receives decoded messages from [`MessageDecoder::process_message`].
///
/// Errors propagate out of the stream's read call untouched.
pub trait MessageProcessor {
    fn process(&mut self, message: LogicalMessage) -> Result<()>;
}

impl<F> MessageProcessor for F
where
    F: FnMut(LogicalMessage) -> Result<()>,
{
    fn process(&mut self, message: LogicalMessage) -> Result<()> {
        self(message)
    }
}

/// Plugin-specific decoding capability.
///
/// Option assembly happens in three layers so the session can retry with
/// progressively smaller sets when the server rejects an option: the
/// try-once extras, then the steady-state set with or without metadata.
pub trait MessageDecoder: Send {
    /// Options the server may reject; applied only on the first attempt.
    fn try_once_options(&self, _options: &mut StreamOptions) {}

    /// Steady-state options when the server accepts metadata emission.
    fn options_with_metadata(&self, options: &mut StreamOptions);

    /// Steady-state options with metadata emission disabled.
    fn options_without_metadata(&self, options: &mut StreamOptions);

    /// Informs the decoder which mode the negotiation settled on.
    fn set_contains_metadata(&mut self, _contains_metadata: bool) {}

    /// Parse one XLogData payload and feed the processor.
    fn process_message(
        &mut self,
        lsn: Lsn,
        buffer: Bytes,
        processor: &mut dyn MessageProcessor,
    ) -> Result<()>;
}

/// Decoder for the in-core `pgoutput` plugin.
///
/// pgoutput has no optional metadata switches; both steady-state sets are
/// the protocol version plus the publications to subscribe.
pub struct PgOutputDecoder {
    publication_names: String,
}

impl PgOutputDecoder {
    pub fn new(publication_names: impl Into<String>) -> Self {
        Self {
            publication_names: publication_names.into(),
        }
    }

    fn base_options(&self, options: &mut StreamOptions) {
        options.set("proto_version", "1");
        options.set("publication_names", self.publication_names.clone());
    }
}

impl MessageDecoder for PgOutputDecoder {
    fn options_with_metadata(&self, options: &mut StreamOptions) {
        self.base_options(options);
    }

    fn options_without_metadata(&self, options: &mut StreamOptions) {
        self.base_options(options);
    }

    fn process_message(
        &mut self,
        lsn: Lsn,
        buffer: Bytes,
        processor: &mut dyn MessageProcessor,
    ) -> Result<()> {
        processor.process(LogicalMessage { lsn, data: buffer })
    }
}

/// Decoder for the `wal2json` plugin.
pub struct Wal2JsonDecoder {
    contains_metadata: bool,
}

impl Wal2JsonDecoder {
    pub fn new() -> Self {
        Self {
            contains_metadata: true,
        }
    }

    /// Whether the negotiated stream carries xid/timestamp metadata.
    pub fn contains_metadata(&self) -> bool {
        self.contains_metadata
    }
}

impl Default for Wal2JsonDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder for Wal2JsonDecoder {
    fn try_once_options(&self, options: &mut StreamOptions) {
        // Rejected by wal2json builds older than 1.0.
        options.set("include-not-null", "true");
    }

    fn options_with_metadata(&self, options: &mut StreamOptions) {
        self.options_without_metadata(options);
        options.set("include-xids", "1");
        options.set("include-timestamp", "1");
    }

    fn options_without_metadata(&self, options: &mut StreamOptions) {
        options.set("pretty-print", "0");
        options.set("write-in-chunks", "1");
    }

    fn set_contains_metadata(&mut self, contains_metadata: bool) {
        self.contains_metadata = contains_metadata;
    }

    fn process_message(
        &mut self,
        lsn: Lsn,
        buffer: Bytes,
        processor: &mut dyn MessageProcessor,
    ) -> Result<()> {
        processor.process(LogicalMessage { lsn, data: buffer })
    }
}
