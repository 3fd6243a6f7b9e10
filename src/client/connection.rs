//! The replication-mode wire connection.
//!
//! Opened with `replication=database` in the startup packet, which limits
//! the session to replication commands issued through the simple query
//! protocol. The connection handles startup and authentication, runs the
//! pre-streaming commands (`IDENTIFY_SYSTEM`, `CREATE_REPLICATION_SLOT`,
//! `START_REPLICATION`), and is then split into the read/write halves the
//! stream works with.

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::auth::ScramExchange;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result, ServerError};
use crate::lsn::Lsn;
use crate::protocol::framing::{
    write_password_message, write_query, write_startup_message, FrameReader,
};
use crate::protocol::messages::{
    parse_auth_request, parse_error_fields, parse_data_row, parse_row_description, SimpleQueryRow,
};

const PROTOCOL_VERSION_3: i32 = 196608;

pub struct ReplicationConnection {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// NoticeResponse frames received outside copy-both mode; handed to
    /// the stream so its periodic warning drain sees them.
    notices: Vec<ServerError>,
}

impl ReplicationConnection {
    /// Connect and authenticate in replication mode.
    pub async fn connect(config: &ConnectionConfig) -> Result<ReplicationConnection> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
        tcp.set_nodelay(true)?;
        let (read_half, write_half) = tcp.into_split();

        let mut conn = ReplicationConnection {
            reader: FrameReader::new(read_half),
            writer: write_half,
            notices: Vec::new(),
        };

        let params = [
            ("user", config.user.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("client_encoding", "UTF8"),
            ("application_name", config.application_name.as_str()),
        ];
        write_startup_message(&mut conn.writer, PROTOCOL_VERSION_3, &params).await?;
        conn.authenticate(config).await?;

        debug!("replication connection to {}:{} ready", config.host, config.port);
        Ok(conn)
    }

    async fn authenticate(&mut self, config: &ConnectionConfig) -> Result<()> {
        loop {
            let msg = self.reader.read_frame().await?;
            match msg.tag {
                b'R' => {
                    let (code, rest) = parse_auth_request(&msg.payload)?;
                    match code {
                        0 => {} // AuthenticationOk
                        3 => {
                            let mut p = config.password.clone().into_bytes();
                            p.push(0);
                            write_password_message(&mut self.writer, &p).await?;
                        }
                        10 => self.auth_scram(config, rest).await?,
                        other => {
                            return Err(Error::Auth(format!(
                                "unsupported authentication method: {other}"
                            )))
                        }
                    }
                }
                b'E' => return Err(Error::Server(parse_error_fields(&msg.payload))),
                b'N' => self.notices.push(parse_error_fields(&msg.payload)),
                b'S' | b'K' => {} // ParameterStatus, BackendKeyData
                b'Z' => return Ok(()),
                other => trace!("ignoring startup-phase message tag {}", other as char),
            }
        }
    }

    async fn auth_scram(&mut self, config: &ConnectionConfig, mechanisms: &[u8]) -> Result<()> {
        let offered = parse_mechanism_list(mechanisms);
        if !offered.iter().any(|m| m == "SCRAM-SHA-256") {
            return Err(Error::Auth(format!(
                "server does not offer SCRAM-SHA-256: {offered:?}"
            )));
        }

        let mut exchange = ScramExchange::start(&config.user);

        // SASLInitialResponse: mechanism cstring + i32 length + payload.
        let first = exchange.client_first();
        let mut init = Vec::with_capacity(first.len() + 20);
        init.extend_from_slice(b"SCRAM-SHA-256");
        init.push(0);
        init.extend_from_slice(&(first.len() as i32).to_be_bytes());
        init.extend_from_slice(first.as_bytes());
        write_password_message(&mut self.writer, &init).await?;

        // AuthenticationSASLContinue (11)
        let server_first = self.read_sasl_payload(11).await?;
        let client_final =
            exchange.client_final(&config.password, &String::from_utf8_lossy(&server_first))?;
        write_password_message(&mut self.writer, client_final.as_bytes()).await?;

        // AuthenticationSASLFinal (12)
        let server_final = self.read_sasl_payload(12).await?;
        exchange.verify_server_final(&String::from_utf8_lossy(&server_final))
    }

    async fn read_sasl_payload(&mut self, want_code: i32) -> Result<Vec<u8>> {
        loop {
            let msg = self.reader.read_frame().await?;
            match msg.tag {
                b'R' => {
                    let (code, rest) = parse_auth_request(&msg.payload)?;
                    if code != want_code {
                        return Err(Error::Auth(format!(
                            "unexpected auth code {code}, expected {want_code}"
                        )));
                    }
                    return Ok(rest.to_vec());
                }
                b'E' => return Err(Error::Server(parse_error_fields(&msg.payload))),
                b'N' => self.notices.push(parse_error_fields(&msg.payload)),
                _ => {}
            }
        }
    }

    /// Run one command through the simple query protocol, collecting text
    /// rows. On a server error the response is drained through
    /// ReadyForQuery first, leaving the connection usable for a retry.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<SimpleQueryRow>> {
        trace!("simple query: {sql}");
        write_query(&mut self.writer, sql).await?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::new();
        let mut server_err: Option<ServerError> = None;

        loop {
            let msg = self.reader.read_frame().await?;
            match msg.tag {
                b'T' => columns = parse_row_description(&msg.payload)?,
                b'D' => {
                    let values = parse_data_row(&msg.payload)?;
                    rows.push(SimpleQueryRow::new(columns.clone(), values));
                }
                b'C' | b'I' => {} // CommandComplete, EmptyQueryResponse
                b'E' => server_err = Some(parse_error_fields(&msg.payload)),
                b'N' => self.notices.push(parse_error_fields(&msg.payload)),
                b'Z' => {
                    return match server_err {
                        Some(err) => Err(Error::Server(err)),
                        None => Ok(rows),
                    }
                }
                other => trace!("ignoring simple-query message tag {}", other as char),
            }
        }
    }

    /// `IDENTIFY_SYSTEM`; only the `xlogpos` column is consumed.
    pub async fn identify_system(&mut self) -> Result<Lsn> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.first().ok_or(Error::NotAReplicationConnection)?;
        let xlogpos = row
            .get("xlogpos")
            .ok_or_else(|| Error::Protocol("IDENTIFY_SYSTEM row lacks xlogpos".into()))?;
        debug!("server reports xlogpos '{xlogpos}'");
        Ok(Lsn::parse(xlogpos)?)
    }

    /// Create a temporary slot. TEMPORARY is only available as a raw
    /// replication command; the slot dies with this connection.
    pub async fn create_temporary_slot(&mut self, slot: &str, plugin: &str) -> Result<()> {
        debug!("creating temporary replication slot '{slot}' for plugin '{plugin}'");
        self.simple_query(&format!(
            "CREATE_REPLICATION_SLOT {slot} TEMPORARY LOGICAL {plugin}"
        ))
        .await?;
        Ok(())
    }

    /// Issue `START_REPLICATION` and wait for the server to switch into
    /// copy-both mode.
    pub async fn start_replication(&mut self, sql: &str) -> Result<()> {
        debug!("starting replication: {sql}");
        write_query(&mut self.writer, sql).await?;

        loop {
            let msg = self.reader.read_frame().await?;
            match msg.tag {
                b'W' => return Ok(()),
                b'E' => {
                    // Drain to ReadyForQuery so the caller can retry with
                    // different options on this same connection.
                    let err = parse_error_fields(&msg.payload);
                    loop {
                        let next = self.reader.read_frame().await?;
                        match next.tag {
                            b'Z' => break,
                            b'N' => self.notices.push(parse_error_fields(&next.payload)),
                            _ => {}
                        }
                    }
                    return Err(Error::Server(err));
                }
                b'N' => self.notices.push(parse_error_fields(&msg.payload)),
                b'S' | b'K' | b'C' => {}
                other => trace!("ignoring pre-copy message tag {}", other as char),
            }
        }
    }

    /// Tear the connection apart for streaming. Notices collected during
    /// the handshake ride along.
    pub fn into_stream_parts(self) -> (FrameReader<OwnedReadHalf>, OwnedWriteHalf, Vec<ServerError>) {
        (self.reader, self.writer, self.notices)
    }

    /// Close the socket. Used on construction failure paths; a live
    /// session closes through the stream instead.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

fn parse_mechanism_list(mut b: &[u8]) -> Vec<String> {
    let mut offered = Vec::new();
    while let Some(pos) = b.iter().position(|&x| x == 0) {
        if pos == 0 {
            break;
        }
        offered.push(String::from_utf8_lossy(&b[..pos]).to_string());
        b = &b[pos + 1..];
    }
    offered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_list_stops_at_empty_terminator() {
        let raw = b"SCRAM-SHA-256\0SCRAM-SHA-256-PLUS\0\0";
        assert_eq!(
            parse_mechanism_list(raw),
            vec!["SCRAM-SHA-256".to_string(), "SCRAM-SHA-256-PLUS".to_string()]
        );
        assert!(parse_mechanism_list(b"\0").is_empty());
    }
}
