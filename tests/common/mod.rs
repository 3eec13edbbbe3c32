#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use labslot::config::EventConfig;
use labslot::engine::ReservationEngine;
use labslot::notify::NotifyHub;
use labslot::store::ReservationTable;
use labslot::wire;

pub const PASSWORD: &str = "labslot";
pub const DAY1: &str = "2025-11-11";
pub const DAY2: &str = "2025-11-12";

pub fn event_config() -> EventConfig {
    EventConfig {
        stations: vec!["A".into(), "B".into()],
        master_code: Some("9999".into()),
        ..EventConfig::default()
    }
}

pub async fn start_test_server() -> SocketAddr {
    start_server_with(event_config()).await
}

pub async fn start_server_with(config: EventConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("labslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let table = ReservationTable::open(&dir.join("reservations.wal"), Arc::new(NotifyHub::new())).unwrap();
    let engine = Arc::new(ReservationEngine::new(Arc::new(table), Arc::new(config)));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(
                    socket,
                    engine,
                    PASSWORD.to_string(),
                    Duration::from_secs(5),
                    None,
                )
                .await;
            });
        }
    });

    addr
}

pub async fn try_connect(
    addr: SocketAddr,
    password: &str,
) -> Result<(tokio_postgres::Client, mpsc::UnboundedReceiver<Notification>), tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("labslot")
        .user("kiosk")
        .password(password);

    let (client, mut connection) = config.connect(NoTls).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    Ok((client, rx))
}

pub async fn connect(addr: SocketAddr) -> (tokio_postgres::Client, mpsc::UnboundedReceiver<Notification>) {
    try_connect(addr, PASSWORD).await.unwrap()
}

/// Wait for a notification with timeout.
pub async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

pub async fn book(
    client: &tokio_postgres::Client,
    student_id: &str,
    code: &str,
    date: &str,
    lab: &str,
    slot: &str,
) -> Result<u64, tokio_postgres::Error> {
    client
        .execute(
            "INSERT INTO reservations (student_id, student_name, auth_number, date, lab_id, time_slot) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[&student_id, &"Student", &code, &date, &lab, &slot],
        )
        .await
}

pub async fn cancel(
    client: &tokio_postgres::Client,
    student_id: &str,
    code: &str,
    date: &str,
    lab: &str,
    slot: &str,
) -> Result<u64, tokio_postgres::Error> {
    client
        .execute(
            "DELETE FROM reservations WHERE student_id = $1 AND auth_number = $2 \
             AND date = $3 AND lab_id = $4 AND time_slot = $5",
            &[&student_id, &code, &date, &lab, &slot],
        )
        .await
}

/// Data rows of a simple query.
pub async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// The board row of one time slot.
pub async fn slot_row(client: &tokio_postgres::Client, date: &str, lab: &str, student_id: &str, slot: &str) -> SimpleQueryRow {
    rows(
        client,
        &format!("SELECT * FROM slots WHERE date = '{date}' AND lab_id = '{lab}' AND student_id = '{student_id}'"),
    )
    .await
    .into_iter()
    .find(|row| row.get("time_slot") == Some(slot))
    .unwrap()
}
