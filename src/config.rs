use std::time::Duration;

/// Connection identity shared by the replication-mode connection and the
/// control-plane SQL connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,

    pub user: String,
    pub password: String,
    pub database: String,

    /// Reported to the server as `application_name`.
    pub application_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            password: "postgres".into(),
            database: "postgres".into(),
            application_name: "pg-logical-replication".into(),
        }
    }
}

impl ConnectionConfig {
    /// Key/value connection string for the control-plane tokio-postgres
    /// client. The replication connection builds its startup packet from
    /// the individual fields instead.
    pub(crate) fn control_dsn(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} application_name={}",
            self.host, self.port, self.user, self.password, self.database, self.application_name,
        )
    }
}

/// Default interval at which unsolicited standby status updates are sent.
/// A zero interval disables unsolicited updates entirely.
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);
