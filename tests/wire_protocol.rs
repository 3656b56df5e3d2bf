use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, DurationRound, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use facility::directory::{Directory, StaticDirectory};
use facility::engine::{Engine, InMemoryStore};
use facility::model::Permission;
use facility::wire;

const ORG: i64 = 10;
const EVENT: i64 = 100;
const ORGANIZER: &str = "1";
const MANAGER: &str = "2";
const STRANGER: &str = "3";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("facility_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(InMemoryStore::open(&dir.join("facility.wal")).unwrap());
    let directory = StaticDirectory::new()
        .grant(1, ORG, Permission::UpdateEvent)
        .grant(2, ORG, Permission::UpdateFacility)
        .event(EVENT, ORG);
    let engine = Arc::new(Engine::new(store, Directory::shared(Arc::new(directory))));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "facility".to_string(), None).await;
            });
        }
    });

    addr
}

fn config(addr: SocketAddr, user: &str) -> Config {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("facility")
        .user(user)
        .password("facility");
    config
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let (client, connection) = config(addr, user).connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn query(client: &Client, sql: &str) -> Result<Vec<SimpleQueryRow>, tokio_postgres::Error> {
    let messages = client.simple_query(sql).await?;
    Ok(messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect())
}

fn sqlstate(err: &tokio_postgres::Error) -> &str {
    err.code().map(|c| c.code()).unwrap_or("none")
}

/// Tomorrow at `hour`, UTC.
fn tomorrow_at(hour: i64) -> String {
    let midnight = (Utc::now() + Duration::days(1))
        .duration_trunc(Duration::days(1))
        .unwrap();
    (midnight + Duration::hours(hour)).to_rfc3339()
}

/// A facility open around the clock every day, so windows built from
/// `Utc::now()` are always inside opening hours.
async fn open_facility(manager: &Client) -> String {
    let rows = query(
        manager,
        &format!(
            "INSERT INTO facilities (organization_id, name, latitude, longitude, description) \
             VALUES ({ORG}, 'Court 1', 13.75, 100.5, 'indoor')"
        ),
    )
    .await
    .unwrap();
    let id = rows[0].get("id").unwrap().to_string();

    let values: Vec<String> = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"]
        .iter()
        .map(|day| format!("('{id}', '{day}', 0, 24)"))
        .collect();
    query(
        manager,
        &format!(
            "INSERT INTO operating_hours (facility_id, day, start_hour, finish_hour) VALUES {}",
            values.join(", ")
        ),
    )
    .await
    .unwrap();
    id
}

async fn book(client: &Client, facility_id: &str, from: i64, to: i64) -> Result<String, tokio_postgres::Error> {
    let rows = query(
        client,
        &format!(
            "INSERT INTO facility_requests (event_id, facility_id, start, finish) \
             VALUES ({EVENT}, '{facility_id}', '{}', '{}')",
            tomorrow_at(from),
            tomorrow_at(to)
        ),
    )
    .await?;
    Ok(rows[0].get("id").unwrap().to_string())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle() {
    let addr = start_test_server().await;
    let manager = connect(addr, MANAGER).await;
    let organizer = connect(addr, ORGANIZER).await;

    let facility_id = open_facility(&manager).await;
    let facility = query(&manager, &format!("SELECT * FROM facilities WHERE id = '{facility_id}'"))
        .await
        .unwrap();
    assert_eq!(facility[0].get("name"), Some("Court 1"));
    assert!(facility[0].get("operating_hours").unwrap().contains("MON 0-24"));

    let request_id = book(&organizer, &facility_id, 10, 12).await.unwrap();
    let request = query(&organizer, &format!("SELECT * FROM facility_requests WHERE id = '{request_id}'"))
        .await
        .unwrap();
    assert_eq!(request[0].get("status"), Some("PENDING"));

    manager
        .simple_query(&format!(
            "UPDATE facility_requests SET status = 'APPROVED' WHERE id = '{request_id}'"
        ))
        .await
        .unwrap();

    // Either side may view; the manager sees the joined row.
    let details = query(
        &manager,
        &format!("SELECT * FROM facility_request_details WHERE id = '{request_id}'"),
    )
    .await
    .unwrap();
    assert_eq!(details[0].get("status"), Some("APPROVED"));
    assert_eq!(details[0].get("facility_name"), Some("Court 1"));

    // The approved window now blocks an overlapping request.
    let err = book(&organizer, &facility_id, 11, 13).await.map(drop).unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    // A request in the gap can still be made.
    book(&organizer, &facility_id, 14, 15).await.unwrap();

    let grid = query(
        &organizer,
        &format!(
            "SELECT * FROM availability WHERE facility_id = '{facility_id}' \
             AND start >= '{}' AND finish <= '{}'",
            tomorrow_at(0),
            tomorrow_at(23)
        ),
    )
    .await
    .unwrap();
    assert_eq!(grid.len(), 24);
    let hour_10 = grid.iter().find(|r| r.get("hour") == Some("10")).unwrap();
    assert!(matches!(hour_10.get("free"), Some("f") | Some("false")));
}

#[tokio::test]
async fn reject_records_reason() {
    let addr = start_test_server().await;
    let manager = connect(addr, MANAGER).await;
    let organizer = connect(addr, ORGANIZER).await;

    let facility_id = open_facility(&manager).await;
    let request_id = book(&organizer, &facility_id, 9, 10).await.unwrap();

    manager
        .simple_query(&format!(
            "UPDATE facility_requests SET status = 'REJECTED', reject_reason = 'maintenance' \
             WHERE id = '{request_id}'"
        ))
        .await
        .unwrap();

    let rows = query(&organizer, &format!("SELECT * FROM facility_requests WHERE id = '{request_id}'"))
        .await
        .unwrap();
    assert_eq!(rows[0].get("status"), Some("REJECTED"));
    assert_eq!(rows[0].get("reject_reason"), Some("maintenance"));

    // Terminal: a second transition finds no pending row.
    let err = manager
        .simple_query(&format!(
            "UPDATE facility_requests SET status = 'APPROVED' WHERE id = '{request_id}'"
        ))
        .await
        .map(drop).unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");
}

#[tokio::test]
async fn permission_errors_carry_sqlstate() {
    let addr = start_test_server().await;
    let manager = connect(addr, MANAGER).await;
    let organizer = connect(addr, ORGANIZER).await;
    let stranger = connect(addr, STRANGER).await;

    let facility_id = open_facility(&manager).await;

    let err = book(&stranger, &facility_id, 10, 11).await.map(drop).unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let request_id = book(&organizer, &facility_id, 10, 11).await.unwrap();

    let err = organizer
        .simple_query(&format!(
            "UPDATE facility_requests SET status = 'APPROVED' WHERE id = '{request_id}'"
        ))
        .await
        .map(drop).unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let err = query(&stranger, &format!("SELECT * FROM facility_requests WHERE id = '{request_id}'"))
        .await
        .map(drop).unwrap_err();
    assert_eq!(sqlstate(&err), "42501");
    let message = err.as_db_error().map(|db| db.message()).unwrap_or_default();
    assert!(message.contains("UPDATE_EVENT"), "{message}");
}

#[tokio::test]
async fn invalid_input_is_rejected() {
    let addr = start_test_server().await;
    let manager = connect(addr, MANAGER).await;
    let organizer = connect(addr, ORGANIZER).await;
    let facility_id = open_facility(&manager).await;

    // Not on the hour.
    let err = query(
        &organizer,
        &format!(
            "INSERT INTO facility_requests (event_id, facility_id, start, finish) \
             VALUES ({EVENT}, '{facility_id}', '{}', '{}')",
            tomorrow_at(10).replace(":00:00", ":30:00"),
            tomorrow_at(11)
        ),
    )
    .await
    .map(drop).unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = query(&manager, &format!("SELECT * FROM facilities WHERE id = '{}'", Ulid::new()))
        .await
        .map(drop).unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    let err = query(&manager, "SELECT * FROM bookings").await.map(drop).unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let manager = connect(addr, MANAGER).await;
    let facility_id = open_facility(&manager).await;

    let rows = manager
        .query("SELECT * FROM facilities WHERE id = $1", &[&facility_id])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let name: String = rows[0].get("name");
    assert_eq!(name, "Court 1");
}

#[tokio::test]
async fn non_numeric_user_cannot_log_in() {
    let addr = start_test_server().await;
    let result = config(addr, "alice").connect(NoTls).await;
    assert!(result.is_err());
}
