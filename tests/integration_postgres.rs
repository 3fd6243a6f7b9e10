#![cfg(feature = "integration-tests")]

//! Integration tests for the slot lifecycle and streaming core.
//!
//! Run with:
//! ```bash
//! cargo test --features integration-tests -- --nocapture
//! ```
//!
//! Override port with PG_ITEST_PORT=55432 if needed.

use anyhow::{Context, Result};
use pg_logical_replication::{
    LogicalMessage, Lsn, PgOutputDecoder, Plugin, ReplicationSession, ReplicationStream,
    SessionBuilder,
};
use std::time::{Duration, Instant};
use testcontainers::runners::AsyncRunner;
use testcontainers::{core::IntoContainerPort, core::WaitFor, ContainerRequest, GenericImage, ImageExt};
use tokio_postgres::NoTls;
use tracing::info;

// ============================================================================
// Test Infrastructure
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

fn get_available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("get local addr")
        .port()
}

fn host_port() -> u16 {
    std::env::var("PG_ITEST_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(get_available_port)
}

fn postgres_image(host_port: u16) -> ContainerRequest<GenericImage> {
    GenericImage::new("postgres", "16-alpine")
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_DB", "postgres")
        .with_cmd([
            "postgres",
            "-c",
            "wal_level=logical",
            "-c",
            "max_replication_slots=10",
            "-c",
            "max_wal_senders=10",
            "-c",
            "wal_keep_size=256MB",
        ])
        .with_mapped_port(host_port, 5432.tcp())
}

// ============================================================================
// Postgres Helpers
// ============================================================================

async fn connect_pg(port: u16) -> Result<tokio_postgres::Client> {
    let dsn = format!("host=127.0.0.1 port={port} user=postgres password=postgres dbname=postgres");
    let (client, conn) = tokio_postgres::connect(&dsn, NoTls)
        .await
        .context("connect control-plane postgres")?;
    tokio::spawn(async move {
        let _ = conn.await;
    });
    Ok(client)
}

async fn wait_for_pg_ready(port: u16, timeout: Duration) -> Result<tokio_postgres::Client> {
    let start = Instant::now();
    loop {
        match connect_pg(port).await {
            Ok(c) => return Ok(c),
            Err(e) => {
                if start.elapsed() > timeout {
                    return Err(e).context("postgres did not become ready in time");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

async fn setup_schema(client: &tokio_postgres::Client) -> Result<()> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS t(id INT PRIMARY KEY, v TEXT);
             DROP PUBLICATION IF EXISTS pub1;
             CREATE PUBLICATION pub1 FOR TABLE t;",
        )
        .await
        .context("setup schema and publication")?;
    Ok(())
}

async fn current_wal_lsn(client: &tokio_postgres::Client) -> Result<Lsn> {
    let row = client
        .query_one("SELECT pg_current_wal_lsn()::text", &[])
        .await?;
    let lsn_str: String = row.get(0);
    Lsn::parse(&lsn_str).with_context(|| format!("parse lsn: {lsn_str}"))
}

async fn slot_exists(client: &tokio_postgres::Client, slot: &str) -> Result<bool> {
    let row = client
        .query_opt(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await?;
    Ok(row.is_some())
}

async fn confirmed_flush_lsn(client: &tokio_postgres::Client, slot: &str) -> Result<Option<Lsn>> {
    let row = client
        .query_one(
            "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await?;
    let text: Option<String> = row.get(0);
    Ok(match text {
        Some(t) => Some(Lsn::parse(&t)?),
        None => None,
    })
}

// ============================================================================
// Replication Helpers
// ============================================================================

async fn build_session(port: u16, slot: &str, drop_on_close: bool) -> Result<ReplicationSession> {
    let mut builder = SessionBuilder::default();
    builder.connection.port = port;
    builder.slot_name = slot.into();
    builder.plugin = Some(Plugin::Pgoutput);
    builder.drop_slot_on_close = drop_on_close;
    builder.status_update_interval = Duration::from_millis(100);

    builder
        .build(Box::new(PgOutputDecoder::new("pub1")))
        .await
        .context("build replication session")
}

/// Read until at least one message is delivered, with an overall deadline.
async fn read_some(stream: &mut ReplicationStream, timeout: Duration) -> Result<Vec<LogicalMessage>> {
    let mut messages: Vec<LogicalMessage> = Vec::new();
    let deadline = Instant::now() + timeout;

    while messages.is_empty() {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .context("timeout waiting for replication messages")?;
        let mut sink = |m: LogicalMessage| -> pg_logical_replication::Result<()> {
            messages.push(m);
            Ok(())
        };
        // read() is cancel-safe, so a timeout just retries.
        match tokio::time::timeout(remaining, stream.read(&mut sink)).await {
            Ok(res) => res?,
            Err(_) => continue,
        }
    }
    Ok(messages)
}

/// Drain deliverable messages until the stream goes quiet.
async fn drain(stream: &mut ReplicationStream, idle: Duration) -> Result<Vec<LogicalMessage>> {
    let mut messages: Vec<LogicalMessage> = Vec::new();
    loop {
        let mut sink = |m: LogicalMessage| -> pg_logical_replication::Result<()> {
            messages.push(m);
            Ok(())
        };
        match tokio::time::timeout(idle, stream.read(&mut sink)).await {
            Ok(res) => res?,
            Err(_) => return Ok(messages),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

/// Fresh slot: the session creates the slot, starts at the server's
/// current position, and the first delivered message is past it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fresh_slot_streams_from_current_position() -> Result<()> {
    init_tracing();
    let port = host_port();
    let _container = postgres_image(port).start().await.expect("start postgres");
    let client = wait_for_pg_ready(port, Duration::from_secs(30)).await?;
    setup_schema(&client).await?;

    let wal_before = current_wal_lsn(&client).await?;
    let mut session = build_session(port, "dbz_test", false).await?;

    assert!(
        slot_exists(&client, "dbz_test").await?,
        "session should have created the slot"
    );
    let starting = session.default_starting_pos();
    assert!(
        starting >= wal_before,
        "fresh slot starts at the server's xlogpos: {starting} >= {wal_before}"
    );

    let mut stream = session.start_streaming(None).await?;
    client
        .execute("INSERT INTO t(id, v) VALUES (1, 'hello')", &[])
        .await?;

    let messages = read_some(&mut stream, Duration::from_secs(10)).await?;
    info!("received {} message(s)", messages.len());
    for m in &messages {
        assert!(
            m.lsn > starting,
            "delivered message at {} must be past the starting position {starting}",
            m.lsn
        );
    }
    assert_eq!(stream.last_received_lsn(), Some(messages.last().unwrap().lsn));

    stream.close().await;
    session.close().await;
    Ok(())
}

/// Resume: an existing slot with a confirmed flush position behind the
/// server's xlogpos resumes from the flush position.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_uses_confirmed_flush_position() -> Result<()> {
    init_tracing();
    let port = host_port();
    let _container = postgres_image(port).start().await.expect("start postgres");
    let client = wait_for_pg_ready(port, Duration::from_secs(30)).await?;
    setup_schema(&client).await?;

    client
        .batch_execute("SELECT pg_create_logical_replication_slot('resume_slot','pgoutput');")
        .await?;
    let flushed = confirmed_flush_lsn(&client, "resume_slot")
        .await?
        .context("fresh slot should record a confirmed flush position")?;

    // Push the server's xlogpos well past the slot's position.
    for i in 0..50 {
        client
            .execute(
                "INSERT INTO t(id, v) VALUES ($1, 'filler') ON CONFLICT (id) DO NOTHING",
                &[&i],
            )
            .await?;
    }
    let wal_now = current_wal_lsn(&client).await?;
    assert!(wal_now > flushed);

    let mut session = build_session(port, "resume_slot", false).await?;
    assert_eq!(
        session.default_starting_pos(),
        flushed,
        "resume takes min(confirmed_flush, xlogpos)"
    );
    session.close().await;
    Ok(())
}

/// Busy slot: a second consumer on an actively streamed slot is refused,
/// and the refused constructor leaves no connection behind.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_slot_is_refused() -> Result<()> {
    init_tracing();
    let port = host_port();
    let _container = postgres_image(port).start().await.expect("start postgres");
    let client = wait_for_pg_ready(port, Duration::from_secs(30)).await?;
    setup_schema(&client).await?;

    let mut session = build_session(port, "busy_slot", false).await?;
    let stream = session.start_streaming(None).await?;

    // Wait for the walsender to register as the active consumer.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let row = client
            .query_one(
                "SELECT active FROM pg_replication_slots WHERE slot_name = 'busy_slot'",
                &[],
            )
            .await?;
        if row.get::<_, bool>(0) {
            break;
        }
        anyhow::ensure!(Instant::now() < deadline, "slot never became active");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let err = match build_session(port, "busy_slot", false).await {
        Ok(_) => anyhow::bail!("second consumer must be refused"),
        Err(e) => e,
    };
    // Alternate formatting prints the whole chain, not just the context.
    let msg = format!("{err:#}");
    anyhow::ensure!(msg.contains("already active"), "unexpected error: {msg}");

    stream.close().await;
    session.close().await;
    Ok(())
}

/// Flush + reconnect: acknowledged positions are never re-delivered, and
/// the slot's confirmed flush advances to what the client reported.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flushed_positions_are_not_redelivered() -> Result<()> {
    init_tracing();
    let port = host_port();
    let _container = postgres_image(port).start().await.expect("start postgres");
    let client = wait_for_pg_ready(port, Duration::from_secs(30)).await?;
    setup_schema(&client).await?;

    let mut session = build_session(port, "ack_slot", false).await?;
    let mut stream = session.start_streaming(None).await?;

    client
        .execute("INSERT INTO t(id, v) VALUES (1, 'first')", &[])
        .await?;
    let mut messages = read_some(&mut stream, Duration::from_secs(10)).await?;
    messages.extend(drain(&mut stream, Duration::from_millis(500)).await?);

    let acked = stream
        .last_received_lsn()
        .context("should have received something")?;
    stream.flush_lsn(acked).await?;

    // Give the status update a moment to land, then verify server-side.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let confirmed = confirmed_flush_lsn(&client, "ack_slot")
        .await?
        .context("slot should have a confirmed flush")?;
    anyhow::ensure!(
        confirmed >= acked,
        "server confirmed flush {confirmed} should cover acked {acked}"
    );

    stream.close().await;
    session.close().await;

    // Reconnect; insert another row and verify nothing at or below the
    // acknowledged position comes back.
    client
        .execute("INSERT INTO t(id, v) VALUES (2, 'second')", &[])
        .await?;
    let mut session2 = build_session(port, "ack_slot", false).await?;
    let mut stream2 = session2.start_streaming(None).await?;

    let replayed = read_some(&mut stream2, Duration::from_secs(10)).await?;
    for m in &replayed {
        anyhow::ensure!(
            m.lsn > acked,
            "message at {} re-delivered despite flush at {acked}",
            m.lsn
        );
    }

    stream2.close().await;
    session2.close().await;
    Ok(())
}

/// Keepalive: with a 100 ms interval and an idle stream, the server keeps
/// seeing the standby. Start/stop are idempotent.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keepalive_keeps_the_standby_visible() -> Result<()> {
    init_tracing();
    let port = host_port();
    let _container = postgres_image(port).start().await.expect("start postgres");
    let client = wait_for_pg_ready(port, Duration::from_secs(30)).await?;
    setup_schema(&client).await?;

    let mut session = build_session(port, "ka_slot", false).await?;
    let mut stream = session.start_streaming(None).await?;

    let handle = tokio::runtime::Handle::current();
    stream.start_keep_alive(&handle);
    stream.start_keep_alive(&handle); // second call is a no-op

    // Idle for a second; the keepalive loop is the only thing talking.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let row = client
        .query_opt(
            "SELECT reply_time FROM pg_stat_replication WHERE application_name = $1",
            &[&"pg-logical-replication"],
        )
        .await?;
    let reply_time: Option<std::time::SystemTime> =
        row.context("standby should be visible in pg_stat_replication")?.get(0);
    let age = std::time::SystemTime::now()
        .duration_since(reply_time.context("standby should have replied")?)
        .unwrap_or_default();
    anyhow::ensure!(
        age < Duration::from_secs(1),
        "status updates should be recent, last reply {age:?} ago"
    );

    stream.stop_keep_alive();
    stream.stop_keep_alive(); // second call is a no-op

    // The stream is still usable after the loop stops.
    client
        .execute("INSERT INTO t(id, v) VALUES (1, 'after-keepalive')", &[])
        .await?;
    let messages = read_some(&mut stream, Duration::from_secs(10)).await?;
    anyhow::ensure!(!messages.is_empty());

    stream.close().await;
    session.close().await;
    Ok(())
}

/// drop_slot_on_close: the slot is gone after close; without the flag it
/// survives at (or past) the acknowledged position.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drop_slot_on_close_removes_the_slot() -> Result<()> {
    init_tracing();
    let port = host_port();
    let _container = postgres_image(port).start().await.expect("start postgres");
    let client = wait_for_pg_ready(port, Duration::from_secs(30)).await?;
    setup_schema(&client).await?;

    let mut session = build_session(port, "ephemeral_slot", true).await?;
    assert!(slot_exists(&client, "ephemeral_slot").await?);
    let stream = session.start_streaming(None).await?;

    stream.close().await;
    session.close().await;
    session.close().await; // idempotent

    // Temporary slots are reaped when the walsender exits; give it a beat.
    let deadline = Instant::now() + Duration::from_secs(10);
    while slot_exists(&client, "ephemeral_slot").await? {
        anyhow::ensure!(
            Instant::now() < deadline,
            "slot should be gone after drop-on-close"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}
