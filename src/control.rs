//! Control-plane SQL session.
//!
//! Replication-mode connections only accept replication commands, so slot
//! introspection, persistent slot creation, slot drop, and server version
//! checks go through a regular tokio-postgres session instead. These
//! connections are short-lived: opened for a task, dropped afterwards.

use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::slot::{SlotInfo, SlotState};

pub struct ControlConnection {
    client: tokio_postgres::Client,
}

impl ControlConnection {
    /// Open a non-replication SQL session. The driver task is spawned on
    /// the current runtime and winds down when the client is dropped.
    pub async fn connect(config: &ConnectionConfig) -> Result<ControlConnection> {
        let (client, connection) = tokio_postgres::connect(&config.control_dsn(), NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("control connection terminated: {e}");
            }
        });
        Ok(ControlConnection { client })
    }

    /// Server major version, e.g. 14 for `server_version_num` 140005.
    pub async fn server_major_version(&self) -> Result<i32> {
        let row = self.client.query_one("SHOW server_version_num", &[]).await?;
        let num: String = row.get(0);
        num.parse::<i32>()
            .map(|v| v / 10_000)
            .map_err(|_| Error::Protocol(format!("unparseable server_version_num: {num}")))
    }

    /// Look up the slot bound to `plugin` in the current database.
    ///
    /// `None` means the server has no such slot (the caller should create
    /// one).
    pub async fn read_slot_info(&self, slot: &str, plugin: &str) -> Result<Option<SlotInfo>> {
        let row = self
            .client
            .query_opt(
                "SELECT active, confirmed_flush_lsn::text, catalog_xmin::text::bigint \
                 FROM pg_replication_slots \
                 WHERE slot_name = $1 AND plugin = $2 AND database = current_database()",
                &[&slot, &plugin],
            )
            .await?;

        let Some(row) = row else { return Ok(None) };
        let active: bool = row.get(0);
        let confirmed_flush_lsn = parse_lsn_column(row.get(1))?;
        let catalog_xmin: Option<i64> = row.get(2);

        Ok(Some(SlotInfo {
            active,
            confirmed_flush_lsn,
            catalog_xmin,
        }))
    }

    /// Confirmed flush position and catalog xmin for a slot that is
    /// expected to exist.
    pub async fn current_slot_state(&self, slot: &str, plugin: &str) -> Result<SlotState> {
        match self.read_slot_info(slot, plugin).await? {
            Some(info) => Ok(SlotState {
                confirmed_flush_lsn: info.confirmed_flush_lsn,
                catalog_xmin: info.catalog_xmin,
            }),
            None => Err(Error::SlotNotFound { slot: slot.to_string() }),
        }
    }

    /// Create a persistent logical slot through the SQL-level API.
    pub async fn create_logical_slot(&self, slot: &str, plugin: &str) -> Result<()> {
        debug!("creating logical replication slot '{slot}' for plugin '{plugin}'");
        self.client
            .execute(
                "SELECT pg_create_logical_replication_slot($1, $2)",
                &[&slot, &plugin],
            )
            .await?;
        Ok(())
    }

    /// Best-effort slot drop. Dropping can race concurrent backend
    /// teardown, so failures are logged and swallowed.
    pub async fn drop_replication_slot(&self, slot: &str) {
        match self
            .client
            .execute("SELECT pg_drop_replication_slot($1)", &[&slot])
            .await
        {
            Ok(_) => debug!("dropped replication slot '{slot}'"),
            Err(e) => warn!("could not drop replication slot '{slot}': {e}"),
        }
    }
}

fn parse_lsn_column(value: Option<String>) -> Result<Option<Lsn>> {
    match value {
        Some(text) => Ok(Some(Lsn::parse(&text)?)),
        None => Ok(None),
    }
}

/// True when slot creation lost a race to another client.
pub(crate) fn is_duplicate_object(err: &Error) -> bool {
    match err {
        Error::Control(e) => e.code() == Some(&SqlState::DUPLICATE_OBJECT),
        Error::Server(e) => {
            e.sqlstate.as_deref() == Some("42710") || e.message.contains("already exists")
        }
        _ => false,
    }
}
