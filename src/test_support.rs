//! Helpers shared by unit and integration tests.

use std::sync::Once;

pub use database::{TestDatabase, TestDatabaseError};

static TEST_LOGGER: Once = Once::new();

/// Route `log` output through the test harness; safe to call from every test.
pub fn init_test_logger() {
    TEST_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub mod database {
    use crate::error::ImportError;
    use crate::store::{PgConfig, PgStore};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use testcontainers::runners::SyncRunner;
    use testcontainers::{Container, TestcontainersError};
    use testcontainers_modules::postgres::Postgres;
    use thiserror::Error;
    use uuid::Uuid;

    #[derive(Debug, Error)]
    pub enum TestDatabaseError {
        #[error("TEST_DATABASE_URL is not set")]
        MissingUrl,
        #[error(transparent)]
        Import(#[from] ImportError),
        #[error(transparent)]
        Container(#[from] TestcontainersError),
    }

    /// A Postgres database for integration tests.
    ///
    /// Connects to `TEST_DATABASE_URL`, or starts a disposable container when
    /// `TEST_DATABASE_CONTAINER=1`. Tables created through
    /// [`create_test_table`](Self::create_test_table) are dropped with it.
    pub struct TestDatabase {
        url: String,
        store: Arc<PgStore>,
        tables: Mutex<Vec<String>>,
        container: Option<Container<Postgres>>,
    }

    impl TestDatabase {
        pub fn new_from_env() -> Result<Self, TestDatabaseError> {
            if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                let store = PgStore::connect(PgConfig::new(url.clone()).max_connections(2))?;
                return Ok(Self {
                    url,
                    store: Arc::new(store),
                    tables: Mutex::new(Vec::new()),
                    container: None,
                });
            }

            if std::env::var("TEST_DATABASE_CONTAINER").as_deref() != Ok("1") {
                return Err(TestDatabaseError::MissingUrl);
            }

            let container = Postgres::default().start()?;
            let host = container.get_host()?.to_string();
            let port = container.get_host_port_ipv4(5432)?;
            let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let store = PgStore::connect(PgConfig::new(url.clone()).max_connections(2))?;
            Ok(Self {
                url,
                store: Arc::new(store),
                tables: Mutex::new(Vec::new()),
                container: Some(container),
            })
        }

        pub fn store(&self) -> Arc<PgStore> {
            self.store.clone()
        }

        /// A separate store on the same database, with its own pool and
        /// column cache.
        pub fn connect_store(
            &self,
            configure: impl FnOnce(PgConfig) -> PgConfig,
        ) -> Result<Arc<PgStore>, TestDatabaseError> {
            let store = PgStore::connect(configure(PgConfig::new(self.url.clone())))?;
            Ok(Arc::new(store))
        }

        /// Create a uniquely named table shaped like a typical import target
        /// and return its name.
        pub fn create_test_table(&self) -> Result<String, TestDatabaseError> {
            let name = format!("test_table_{}", Uuid::new_v4().simple());
            self.store.execute(&format!(
                "CREATE TABLE \"{name}\" (
                    id BIGSERIAL PRIMARY KEY,
                    a VARCHAR(255) NOT NULL,
                    b VARCHAR(255),
                    c VARCHAR(255),
                    d TIMESTAMP(0),
                    last_batch_id BIGINT,
                    created_at TIMESTAMP(0),
                    updated_at TIMESTAMP(0)
                )"
            ))?;
            self.tables.lock().push(name.clone());
            Ok(name)
        }
    }

    impl Drop for TestDatabase {
        fn drop(&mut self) {
            for table in self.tables.lock().drain(..) {
                if let Err(err) = self.store.execute(&format!("DROP TABLE IF EXISTS \"{table}\"")) {
                    log::warn!("failed to drop test table {}: {}", table, err);
                }
            }
            if let Some(container) = self.container.take() {
                drop(container);
            }
        }
    }
}
