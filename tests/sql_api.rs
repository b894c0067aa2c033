use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use hotdesk::auth::TokenService;
use hotdesk::clock::{Clock, SystemClock};
use hotdesk::config::AdminSeed;
use hotdesk::tenant::{TenantManager, TenantOptions};
use hotdesk::wire;

const SECRET: &str = "integration-secret-of-32-characters";
const ADMIN_EMAIL: &str = "root@example.com";
const ADMIN_PASSWORD: &str = "change-me-please";
const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("hotdesk_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let options = TenantOptions {
        compact_threshold: 1000,
        sweep_interval: None,
        admin: Some(AdminSeed {
            email: ADMIN_EMAIL.into(),
            password: ADMIN_PASSWORD.into(),
        }),
    };
    let tm = Arc::new(TenantManager::new(dir, options, clock.clone()));
    let tokens = Arc::new(TokenService::new(SECRET, 900, 3600, clock).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            let tokens = tokens.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, tokens, "hotdesk".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user("hotdesk")
        .password("hotdesk");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn query(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e:?}"))
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failing statement.
async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.err().unwrap_or_else(|| panic!("{sql} succeeded"));
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("not a server error: {err:?}"))
}

/// Log in and attach the access token to the session.
async fn login(client: &tokio_postgres::Client, email: &str, password: &str) -> (String, String) {
    let rows = query(
        client,
        &format!("SELECT * FROM login WHERE email = '{email}' AND password = '{password}'"),
    )
    .await;
    let access = rows[0].get("access_token").unwrap().to_string();
    let refresh = rows[0].get("refresh_token").unwrap().to_string();
    client
        .batch_execute(&format!("SET hotdesk.token = '{access}'"))
        .await
        .unwrap();
    (access, refresh)
}

fn tomorrow_at(hour: i64) -> i64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64;
    (now / DAY + 1) * DAY + hour * HOUR
}

struct Catalogue {
    branch: Ulid,
    desk_type: Ulid,
    desk: Ulid,
}

async fn seed_catalogue(admin: &tokio_postgres::Client) -> Catalogue {
    let (branch, desk_type, desk) = (Ulid::new(), Ulid::new(), Ulid::new());
    admin
        .batch_execute(&format!(
            "INSERT INTO branches (id, name, opening_hour, closing_hour) VALUES ('{branch}', 'Central', 8, 20)"
        ))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            "INSERT INTO seating_types (id, name, hourly_rate, daily_rate, monthly_rate) \
             VALUES ('{desk_type}', 'Hot desk', 25, 150, 5000)"
        ))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            "INSERT INTO seats (id, branch_id, seating_type_id, label) VALUES ('{desk}', '{branch}', '{desk_type}', 'D-1')"
        ))
        .await
        .unwrap();
    Catalogue {
        branch,
        desk_type,
        desk,
    }
}

async fn sign_up(client: &tokio_postgres::Client, email: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO accounts (id, email, name, password) VALUES ('{id}', '{email}', 'Sam', 'correct-horse')"
        ))
        .await
        .unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn catalogue_is_public_but_writes_need_admin() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    login(&admin, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let cat = seed_catalogue(&admin).await;

    let anon = connect(addr).await;
    let branches = query(&anon, "SELECT * FROM branches").await;
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].get("id"), Some(cat.branch.to_string().as_str()));
    assert_eq!(branches[0].get("opening_hour"), Some("8"));

    let seats = query(&anon, &format!("SELECT * FROM seats WHERE branch_id = '{}'", cat.branch)).await;
    assert_eq!(seats[0].get("status"), Some("AVAILABLE"));

    let write = format!(
        "INSERT INTO branches (id, name, opening_hour, closing_hour) VALUES ('{}', 'North', 8, 20)",
        Ulid::new()
    );
    assert_eq!(sqlstate(&anon, &write).await, "28000");

    sign_up(&anon, "sam@example.com").await;
    login(&anon, "sam@example.com", "correct-horse").await;
    assert_eq!(sqlstate(&anon, &write).await, "42501");
    assert_eq!(sqlstate(&anon, "SELECT * FROM accounts").await, "42501");
}

#[tokio::test]
async fn customer_books_pays_and_earns_coins() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    login(&admin, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let cat = seed_catalogue(&admin).await;

    let customer = connect(addr).await;
    let me = sign_up(&customer, "sam@example.com").await;
    login(&customer, "sam@example.com", "correct-horse").await;

    let booking = Ulid::new();
    let (start, end) = (tomorrow_at(9), tomorrow_at(11));
    customer
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, seat_id, start, "end", duration_type) VALUES ('{booking}', '{}', {start}, {end}, 'HOURLY')"#,
            cat.desk
        ))
        .await
        .unwrap();

    let mine = query(&customer, "SELECT * FROM bookings").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("customer_id"), Some(me.to_string().as_str()));
    assert_eq!(mine[0].get("status"), Some("PENDING"));
    assert_eq!(mine[0].get("price"), Some("50"));

    customer
        .batch_execute(&format!("INSERT INTO payments (booking_id, reference) VALUES ('{booking}', 'txn-1')"))
        .await
        .unwrap();
    let mine = query(&customer, "SELECT * FROM bookings").await;
    assert_eq!(mine[0].get("status"), Some("CONFIRMED"));

    let profile = query(&customer, "SELECT * FROM me").await;
    assert_eq!(profile[0].get("email"), Some("sam@example.com"));
    assert_eq!(profile[0].get("coins"), mine[0].get("coins"));
}

#[tokio::test]
async fn overlapping_booking_is_a_conflict() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    login(&admin, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let cat = seed_catalogue(&admin).await;

    let customer = connect(addr).await;
    sign_up(&customer, "sam@example.com").await;
    login(&customer, "sam@example.com", "correct-horse").await;

    let first = Ulid::new();
    let insert = |id: Ulid, from: i64, to: i64| {
        format!(
            r#"INSERT INTO bookings (id, seat_id, start, "end", duration_type) VALUES ('{id}', '{}', {from}, {to}, 'HOURLY')"#,
            cat.desk
        )
    };
    customer
        .batch_execute(&insert(first, tomorrow_at(9), tomorrow_at(11)))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&customer, &insert(Ulid::new(), tomorrow_at(10), tomorrow_at(12))).await,
        "23P01"
    );

    // Free for the window again once cancelled.
    customer
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{first}'"))
        .await
        .unwrap();
    let free = query(
        &customer,
        &format!(
            r#"SELECT * FROM free_seats WHERE seating_type_id = '{}' AND start >= {} AND "end" <= {}"#,
            cat.desk_type,
            tomorrow_at(10),
            tomorrow_at(12)
        ),
    )
    .await;
    assert_eq!(free.len(), 1);
}

#[tokio::test]
async fn customers_cannot_touch_each_others_bookings() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    login(&admin, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let cat = seed_catalogue(&admin).await;

    let alice = connect(addr).await;
    sign_up(&alice, "alice@example.com").await;
    login(&alice, "alice@example.com", "correct-horse").await;
    let bob = connect(addr).await;
    let bob_id = sign_up(&bob, "bob@example.com").await;
    login(&bob, "bob@example.com", "correct-horse").await;

    let booking = Ulid::new();
    alice
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, seat_id, start, "end", duration_type) VALUES ('{booking}', '{}', {}, {}, 'DAILY')"#,
            cat.desk,
            tomorrow_at(0),
            tomorrow_at(24)
        ))
        .await
        .unwrap();

    assert_eq!(
        sqlstate(&bob, &format!("DELETE FROM bookings WHERE id = '{booking}'")).await,
        "42501"
    );
    assert!(query(&bob, "SELECT * FROM bookings").await.is_empty());
    let booking_for_bob = format!(
        r#"INSERT INTO bookings (id, seat_id, start, "end", duration_type, customer_id) VALUES ('{}', '{}', {}, {}, 'HOURLY', '{bob_id}')"#,
        Ulid::new(),
        cat.desk,
        tomorrow_at(30),
        tomorrow_at(31)
    );
    assert_eq!(sqlstate(&alice, &booking_for_bob).await, "42501");

    // Admins see everything.
    assert_eq!(query(&admin, "SELECT * FROM bookings").await.len(), 1);
}

#[tokio::test]
async fn verify_booking_quotes_price() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    login(&admin, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let cat = seed_catalogue(&admin).await;

    let anon = connect(addr).await;
    let rows = query(
        &anon,
        &format!(
            r#"SELECT * FROM verify_booking WHERE seating_type_id = '{}' AND seat_count = 2
               AND start >= {} AND "end" <= {} AND duration_type = 'DAILY'"#,
            cat.desk_type,
            tomorrow_at(0),
            tomorrow_at(48)
        ),
    )
    .await;
    assert_eq!(rows[0].get("available"), Some("1"));
    assert_eq!(rows[0].get("bookable"), Some("1"));
    assert_eq!(rows[0].get("can_book"), Some("f"));
    assert_eq!(rows[0].get("units"), Some("2"));
    assert_eq!(rows[0].get("total_price"), Some("300"));
}

#[tokio::test]
async fn refresh_rotates_and_logout_revokes() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (access, refresh) = login(&client, ADMIN_EMAIL, ADMIN_PASSWORD).await;

    let rotated = query(&client, &format!("SELECT * FROM refresh WHERE token = '{refresh}'")).await;
    assert_eq!(rotated[0].get("role"), Some("ADMIN"));
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM refresh WHERE token = '{refresh}'")).await,
        "28000"
    );

    let out = query(&client, &format!("SELECT * FROM logout WHERE token = '{access}'")).await;
    assert_eq!(out[0].get("revoked"), Some("t"));
    assert_eq!(sqlstate(&client, "SELECT * FROM me").await, "28000");

    client.batch_execute("RESET hotdesk.token").await.unwrap();
    assert_eq!(sqlstate(&client, "SELECT * FROM me").await, "28000");
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM login WHERE email = '{ADMIN_EMAIL}' AND password = 'nope-nope'")).await,
        "28000"
    );
    assert_eq!(
        sqlstate(&client, "SELECT * FROM login WHERE email = 'ghost@example.com' AND password = 'nope-nope'").await,
        "28000"
    );
    assert_eq!(sqlstate(&client, "SET hotdesk.token = 'not-a-jwt'").await, "28000");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    login(&admin, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let cat = seed_catalogue(&admin).await;

    let branch = cat.branch.to_string();
    let rows = admin
        .query("SELECT * FROM seats WHERE branch_id = $1", &[&branch])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let label: String = rows[0].get("label");
    assert_eq!(label, "D-1");
}

#[tokio::test]
async fn syntax_errors_and_unknown_tables() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    assert_eq!(sqlstate(&client, "SELEKT nothing").await, "42601");
    assert_eq!(sqlstate(&client, "SELECT * FROM desks").await, "42601");
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                r#"SELECT * FROM time_slots WHERE seat_id = '{}' AND start >= {} AND "end" <= {}"#,
                Ulid::new(),
                tomorrow_at(8),
                tomorrow_at(20)
            )
        )
        .await,
        "P0002"
    );
}
