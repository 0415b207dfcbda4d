use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use error_stack::{Report, ResultExt};
use tokio_postgres::{
    tls::{MakeTlsConnect, TlsConnect},
    Client, GenericClient, Socket, Transaction,
};

use crate::{
    config::{DatabaseConnectionInfo, DatabasePoolConfig},
    store::{PostgresStore, StoreError},
};

/// Connection pool handing out [`PostgresStore`]s.
pub struct PostgresStorePool {
    pool: Pool,
}

impl PostgresStorePool {
    /// Creates a new pool from the connection info.
    ///
    /// # Errors
    ///
    /// - if the pool cannot be constructed from the configuration.
    #[tracing::instrument(skip(tls))]
    pub async fn new<Tls>(
        db_info: &DatabaseConnectionInfo,
        pool_config: &DatabasePoolConfig,
        tls: Tls,
    ) -> Result<Self, Report<StoreError>>
    where
        Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
        Tls::Stream: Send + Sync,
        Tls::TlsConnect: Send + Sync,
        <Tls::TlsConnect as TlsConnect<Socket>>::Future: Send,
    {
        tracing::debug!(url = %db_info, "creating connection pool to Postgres");

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .user(db_info.user())
            .password(db_info.password())
            .host(db_info.host())
            .port(db_info.port())
            .dbname(db_info.database());

        // Reference data changes rarely, so connections sit idle for whole
        // notification-poll intervals and can be reaped by server-side
        // timeouts in the meantime. Verified recycling re-checks a connection
        // before handing it out again; nothing in this crate leaves session
        // state behind that would call for a full Clean.
        let manager = Manager::from_config(
            pg_config,
            tls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Verified,
            },
        );

        Ok(Self {
            pool: Pool::builder(manager)
                .max_size(pool_config.max_connections.get())
                .build()
                .change_context(StoreError)
                .attach_printable_lazy(|| db_info.clone())?,
        })
    }

    /// Retrieves an owned [`PostgresStore`] from the pool.
    ///
    /// # Errors
    ///
    /// - if no connection can be acquired.
    pub async fn acquire(&self) -> Result<PostgresStore<Object>, Report<StoreError>> {
        Ok(PostgresStore::new(
            self.pool.get().await.change_context(StoreError)?,
        ))
    }

    /// Closes the pool. Outstanding connections are dropped when returned.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Unifies the handles a store can sit on top of: query code written against
/// [`AsClient`] runs identically on a pooled connection, a bare client, or
/// inside a transaction.
pub trait AsClient: Send + Sync {
    type Client: GenericClient + Send + Sync;

    fn as_client(&self) -> &Self::Client;
    fn as_mut_client(&mut self) -> &mut Self::Client;
}

/// Handles that execute queries themselves hand out `Self`.
macro_rules! direct_client {
    ($($client:ty),* $(,)?) => {$(
        impl AsClient for $client {
            type Client = Self;

            fn as_client(&self) -> &Self {
                self
            }

            fn as_mut_client(&mut self) -> &mut Self {
                self
            }
        }
    )*};
}

direct_client!(Client, Transaction<'_>);

// A pooled connection is only a wrapper; queries go to the client it wraps.
impl AsClient for Object {
    type Client = Client;

    fn as_client(&self) -> &Client {
        self
    }

    fn as_mut_client(&mut self) -> &mut Client {
        self
    }
}
