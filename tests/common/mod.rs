//! Shared test helpers for integration tests using Testcontainers.

use postgres::{Client, NoTls};
use testcontainers::{Container, ImageExt, runners::SyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Destination tables used across the end-to-end tests.
#[allow(dead_code)]
pub const SCHEMA_DDL: &str = r#"
CREATE TABLE person (
    id         INTEGER GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    email      TEXT NOT NULL UNIQUE,
    name       TEXT,
    age        INTEGER,
    name_upper TEXT GENERATED ALWAYS AS (upper(name)) STORED
);

CREATE TABLE account (
    id      BIGSERIAL PRIMARY KEY,
    code    VARCHAR(20) NOT NULL,
    balance NUMERIC(12, 2) NOT NULL DEFAULT 0,
    opened  DATE,
    tags    JSONB
);

CREATE TABLE tag (
    label TEXT PRIMARY KEY,
    hits  BIGINT NOT NULL DEFAULT 0
);
"#;

/// Route the crate's `tracing` output to the test writer.
///
/// Filtered by `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A test database backed by a Testcontainers PostgreSQL instance.
///
/// The container is automatically cleaned up when `TestDb` is dropped.
pub struct TestDb {
    pub client: Client,
    connection_string: String,
    _container: Container<Postgres>,
}

#[allow(dead_code)]
impl TestDb {
    /// Start a fresh PostgreSQL container and connect to it.
    pub fn new() -> Self {
        init_tracing();
        let container = Postgres::default()
            .with_tag("17-alpine")
            .start()
            .expect("Failed to start PostgreSQL container");

        let port = container
            .get_host_port_ipv4(5432)
            .expect("Failed to get mapped port");

        let connection_string =
            format!("host=127.0.0.1 port={port} user=postgres password=postgres dbname=postgres");
        let client =
            Client::connect(&connection_string, NoTls).expect("Failed to connect to test database");

        TestDb {
            client,
            connection_string,
            _container: container,
        }
    }

    /// Start a fresh container with the test tables pre-created.
    pub fn with_schema() -> Self {
        let mut db = Self::new();
        db.client
            .batch_execute(SCHEMA_DDL)
            .expect("Failed to create test tables");
        db
    }

    /// A second, independent connection to the same database.
    pub fn connect(&self) -> Client {
        Client::connect(&self.connection_string, NoTls).expect("Failed to open second connection")
    }

    /// Execute a SQL statement.
    pub fn execute(&mut self, sql: &str) {
        self.client
            .batch_execute(sql)
            .unwrap_or_else(|e| panic!("SQL execution failed: {}\nSQL: {}", e, sql));
    }

    /// Count rows in a table.
    pub fn count(&mut self, table: &str) -> i64 {
        self.client
            .query_one(&format!("SELECT count(*) FROM {}", table), &[])
            .unwrap_or_else(|e| panic!("count failed: {}", e))
            .get(0)
    }

    /// Number of relations whose name starts with `prefix`.
    pub fn relations_named_like(&mut self, prefix: &str) -> i64 {
        self.client
            .query_one(
                "SELECT count(*) FROM pg_class WHERE starts_with(relname, $1)",
                &[&prefix],
            )
            .unwrap_or_else(|e| panic!("relation lookup failed: {}", e))
            .get(0)
    }

    /// Whether a relation with this name exists anywhere.
    pub fn relation_exists(&mut self, name: &str) -> bool {
        self.client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_class WHERE relname = $1)",
                &[&name],
            )
            .unwrap_or_else(|e| panic!("relation lookup failed: {}", e))
            .get(0)
    }
}
