//! Shared PostgreSQL fixtures for mender integration tests.
//!
//! One server is shared by every test in a binary; each test gets its own
//! freshly migrated database inside it. Set `MENDER_TEST_PG_URL` to a
//! server-root URL (no database name) to reuse an external instance --
//! for example from a nextest setup script -- otherwise a container is
//! started on first use and kept alive for the life of the process.

use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use mender_db::config::DbConfig;
use mender_db::pool;

static POSTGRES: OnceCell<TestPostgres> = OnceCell::const_new();

/// The shared server, addressed through its maintenance database.
struct TestPostgres {
    admin: DbConfig,
    /// Keeps the container running; `None` for an external server.
    _keep_alive: Option<ContainerAsync<Postgres>>,
}

impl TestPostgres {
    async fn get() -> &'static TestPostgres {
        POSTGRES.get_or_init(Self::start).await
    }

    async fn start() -> TestPostgres {
        if let Ok(base) = std::env::var("MENDER_TEST_PG_URL") {
            return TestPostgres {
                admin: DbConfig::new(format!("{base}/postgres")),
                _keep_alive: None,
            };
        }

        let container = Postgres::default()
            .with_tag("18")
            .start()
            .await
            .expect("postgres container should start");
        let host = container.get_host().await.expect("container host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("mapped postgres port");

        TestPostgres {
            admin: DbConfig::new(format!("postgresql://postgres:postgres@{host}:{port}/postgres")),
            _keep_alive: Some(container),
        }
    }
}

/// Create a fresh database with migrations applied.
///
/// Returns a pool into the new database and its generated name; hand the
/// name back to [`drop_test_db`] when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let server = TestPostgres::get().await;
    let name = format!("mender_test_{}", Uuid::new_v4().simple());

    let admin = pool::connect(&server.admin)
        .await
        .expect("maintenance database should be reachable");
    admin
        .execute(format!("CREATE DATABASE {name}").as_str())
        .await
        .unwrap_or_else(|e| panic!("creating {name} failed: {e}"));
    admin.close().await;

    let db = pool::connect(&server.admin.with_database(&name))
        .await
        .unwrap_or_else(|e| panic!("connecting to {name} failed: {e}"));
    pool::migrate(&db).await.expect("migrations should apply");

    (db, name)
}

/// Drop a database created by [`create_test_db`]. Best-effort: leftover
/// connections are terminated first, and an already-dropped database is
/// not an error.
pub async fn drop_test_db(name: &str) {
    let server = TestPostgres::get().await;
    let Ok(admin) = pool::connect(&server.admin).await else {
        return;
    };

    let _ = admin
        .execute(
            format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = '{name}'"
            )
            .as_str(),
        )
        .await;
    let _ = admin
        .execute(format!("DROP DATABASE IF EXISTS {name}").as_str())
        .await;
    admin.close().await;
}
