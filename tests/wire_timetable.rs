use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use timetabled::config::EngineConfig;
use timetabled::directory::InMemoryDirectory;
use timetabled::engine::Engine;
use timetabled::notify::NotifyHub;
use timetabled::wire::{self, TimetableFactory};

const YEAR: &str = "2024-2025";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("timetabled_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let directory = Arc::new(InMemoryDirectory::new());
    let engine = Arc::new(
        Engine::new(
            dir.join("timetable.wal"),
            Arc::new(NotifyHub::new()),
            directory.clone(),
            EngineConfig::default(),
        )
        .unwrap(),
    );
    let factory = Arc::new(TimetableFactory::new(engine.clone(), directory, "timetabled".into()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect_with(addr: SocketAddr, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("school")
        .user("registrar")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_with(addr, "timetabled").await.unwrap()
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error().map(|e| e.code().code().to_string()).unwrap_or_default()
}

struct Ids {
    class_a: Ulid,
    class_b: Ulid,
    teacher: Ulid,
    subject: Ulid,
}

async fn seed(client: &Client) -> Ids {
    let ids = Ids {
        class_a: Ulid::new(),
        class_b: Ulid::new(),
        teacher: Ulid::new(),
        subject: Ulid::new(),
    };
    client
        .batch_execute(&format!(
            "INSERT INTO classes (id, name) VALUES ('{}', '9A');
             INSERT INTO classes (id, name) VALUES ('{}', '9B');
             INSERT INTO teachers (id, name) VALUES ('{}', 'Mr Lindqvist');
             INSERT INTO subjects (id, name) VALUES ('{}', 'Geography');",
            ids.class_a, ids.class_b, ids.teacher, ids.subject
        ))
        .await
        .unwrap();
    ids
}

async fn book(client: &Client, class: Ulid, teacher: Ulid, subject: Ulid, start: &str, end: &str) -> Result<Ulid, tokio_postgres::Error> {
    let messages = client
        .simple_query(&format!(
            "INSERT INTO bookings (class_id, teacher_id, subject_id, day, start_time, end_time, academic_year, room)
             VALUES ('{class}', '{teacher}', '{subject}', 'monday', '{start}', '{end}', '{YEAR}', 'R12')"
        ))
        .await?;
    let inserted = rows(messages);
    assert_eq!(inserted.len(), 1);
    Ok(inserted[0].get("id").unwrap().parse().unwrap())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_then_select_booking() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let ids = seed(&client).await;

    let id = book(&client, ids.class_a, ids.teacher, ids.subject, "09:00", "10:00").await.unwrap();
    assert_eq!(engine.active_booking_count(), 1);

    let found = rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE id = '{id}'"))
            .await
            .unwrap(),
    );
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("class_id"), Some(ids.class_a.to_string().as_str()));
    assert_eq!(found[0].get("start_time"), Some("09:00"));
    assert_eq!(found[0].get("room"), Some("R12"));
    assert_eq!(found[0].get("is_active"), Some("t"));
}

#[tokio::test]
async fn double_booking_is_rejected_with_exclusion_sqlstate() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let ids = seed(&client).await;

    book(&client, ids.class_a, ids.teacher, ids.subject, "09:00", "10:00").await.unwrap();

    // Same teacher, different class, overlapping time
    let err = book(&client, ids.class_b, ids.teacher, ids.subject, "09:30", "10:30").await.unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
    assert!(err.as_db_error().unwrap().message().contains("teacher"));

    // Back-to-back is fine
    book(&client, ids.class_b, ids.teacher, ids.subject, "10:00", "11:00").await.unwrap();
    assert_eq!(engine.active_booking_count(), 2);
}

#[tokio::test]
async fn invalid_values_map_to_sqlstates() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let ids = seed(&client).await;

    let err = book(&client, ids.class_a, ids.teacher, ids.subject, "11:00", "10:00").await.unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = book(&client, ids.class_a, Ulid::new(), ids.subject, "09:00", "10:00").await.unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    let err = client.simple_query("SELECT * FROM holidays").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn class_timetable_lists_named_entries_in_order() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let ids = seed(&client).await;

    book(&client, ids.class_a, ids.teacher, ids.subject, "13:00", "14:00").await.unwrap();
    book(&client, ids.class_a, ids.teacher, ids.subject, "08:00", "09:00").await.unwrap();

    let entries = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM class_timetable WHERE class_id = '{}' AND academic_year = '{YEAR}'",
                ids.class_a
            ))
            .await
            .unwrap(),
    );
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].get("start_time"), Some("08:00"));
    assert_eq!(entries[1].get("start_time"), Some("13:00"));
    assert_eq!(entries[0].get("class_name"), Some("9A"));
    assert_eq!(entries[0].get("teacher_name"), Some("Mr Lindqvist"));
    assert_eq!(entries[0].get("subject_name"), Some("Geography"));
}

#[tokio::test]
async fn availability_is_the_complement_of_bookings() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let ids = seed(&client).await;

    book(&client, ids.class_a, ids.teacher, ids.subject, "09:00", "10:00").await.unwrap();
    book(&client, ids.class_b, ids.teacher, ids.subject, "12:00", "13:00").await.unwrap();

    let slots = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE resource_kind = 'teacher' AND resource_id = '{}' \
                 AND day = 'monday' AND academic_year = '{YEAR}'",
                ids.teacher
            ))
            .await
            .unwrap(),
    );
    let spans: Vec<(&str, &str)> = slots
        .iter()
        .map(|r| (r.get("start_time").unwrap(), r.get("end_time").unwrap()))
        .collect();
    assert_eq!(spans, vec![("08:00", "09:00"), ("10:00", "12:00"), ("13:00", "17:00")]);

    // Narrowed window, two-hour minimum
    let slots = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE resource_kind = 'teacher' AND resource_id = '{}' \
                 AND day = 'monday' AND academic_year = '{YEAR}' AND start >= '08:00' AND \"end\" <= '16:00' \
                 AND min_duration = 7200",
                ids.teacher
            ))
            .await
            .unwrap(),
    );
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].get("duration"), Some("7200"));
    assert_eq!(slots[1].get("start_time"), Some("13:00"));
}

#[tokio::test]
async fn common_availability_intersects_class_and_teacher() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let ids = seed(&client).await;
    let other_teacher = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO teachers (id, name) VALUES ('{other_teacher}', 'Dr Achebe')"))
        .await
        .unwrap();

    // Class A busy 9-10, teacher busy 11-12 with class B
    book(&client, ids.class_a, other_teacher, ids.subject, "09:00", "10:00").await.unwrap();
    book(&client, ids.class_b, ids.teacher, ids.subject, "11:00", "12:00").await.unwrap();

    let slots = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM common_availability WHERE class_id = '{}' AND teacher_id = '{}' \
                 AND day = 'monday' AND academic_year = '{YEAR}'",
                ids.class_a, ids.teacher
            ))
            .await
            .unwrap(),
    );
    let starts: Vec<&str> = slots.iter().map(|r| r.get("start_time").unwrap()).collect();
    assert_eq!(starts, vec!["08:00", "10:00", "12:00"]);
}

#[tokio::test]
async fn update_deactivate_and_delete() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let ids = seed(&client).await;

    let first = book(&client, ids.class_a, ids.teacher, ids.subject, "09:00", "10:00").await.unwrap();
    let second = book(&client, ids.class_b, ids.teacher, ids.subject, "10:00", "11:00").await.unwrap();

    // Moving the second lesson onto the first clashes on the teacher
    let err = client
        .simple_query(&format!("UPDATE bookings SET start_time = '09:30' WHERE id = '{second}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    // Moving within its own slot is fine
    client
        .batch_execute(&format!(
            "UPDATE bookings SET start_time = '10:15', end_time = '11:15' WHERE id = '{second}'"
        ))
        .await
        .unwrap();
    assert_eq!(engine.get_booking(second).unwrap().range.start, 10 * 3600 + 15 * 60);

    client
        .batch_execute(&format!("UPDATE bookings SET is_active = false WHERE id = '{first}'"))
        .await
        .unwrap();
    assert!(!engine.get_booking(first).unwrap().is_active);

    // The freed slot can be taken again
    book(&client, ids.class_a, ids.teacher, ids.subject, "09:00", "10:00").await.unwrap();

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{second}'"))
        .await
        .unwrap();
    let err = client
        .simple_query(&format!("SELECT * FROM bookings WHERE id = '{second}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let ids = seed(&client).await;
    let id = book(&client, ids.class_a, ids.teacher, ids.subject, "09:00", "10:00").await.unwrap();

    let id_text = id.to_string();
    let found = client
        .query("SELECT * FROM bookings WHERE id = $1", &[&id_text])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let day: &str = found[0].get("day");
    assert_eq!(day, "monday");
}

#[tokio::test]
async fn bound_text_with_dollar_signs_is_stored_verbatim() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let ids = seed(&client).await;
    let id = book(&client, ids.class_a, ids.teacher, ids.subject, "09:00", "10:00").await.unwrap();

    let id_text = id.to_string();
    client
        .execute("UPDATE bookings SET room = $1 WHERE id = $2", &[&"Lab $2", &id_text])
        .await
        .unwrap();
    assert_eq!(engine.get_booking(id).unwrap().room.as_deref(), Some("Lab $2"));

    // Numeric filters arrive as bound text too
    let teacher_text = ids.teacher.to_string();
    let slots = client
        .query(
            "SELECT * FROM availability WHERE resource_kind = 'teacher' AND resource_id = $1 \
             AND day = 'monday' AND academic_year = $2 AND min_duration = $3",
            &[&teacher_text, &YEAR, &"7200"],
        )
        .await
        .unwrap();
    let starts: Vec<&str> = slots.iter().map(|r| r.get("start_time")).collect();
    assert_eq!(starts, vec!["10:00"]);
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let (addr, _engine) = start_test_server().await;
    assert!(connect_with(addr, "not-the-password").await.is_err());
}
