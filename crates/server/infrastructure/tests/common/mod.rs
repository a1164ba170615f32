#![allow(dead_code)]

use sqlx::postgres::{PgPool, PgPoolOptions};
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::redis::{REDIS_PORT, Redis};
use tokio::sync::OnceCell;
use uuid::Uuid;

use sqlx::{Connection, PgConnection};

struct SharedPostgresContext {
    _container: ContainerAsync<Postgres>,
    admin_connection_string: String,
    host: String,
    port: u16,
}

struct SharedRedisContext {
    _container: ContainerAsync<Redis>,
    url: String,
}

static POSTGRES_CONTEXT: OnceCell<SharedPostgresContext> = OnceCell::const_new();
static REDIS_CONTEXT: OnceCell<SharedRedisContext> = OnceCell::const_new();

/// A throwaway database on the shared Postgres container, dropped with the value
pub struct PostgresTestDatabase {
    pub connection_string: String,
    db_name: String,
    admin_connection_string: String,
}

impl PostgresTestDatabase {
    pub async fn pool(&self) -> PgPool {
        PgPoolOptions::new()
            .max_connections(5)
            .connect(&self.connection_string)
            .await
            .expect("Failed to connect to test database")
    }
}

impl Drop for PostgresTestDatabase {
    fn drop(&mut self) {
        let db_name = self.db_name.clone();
        let admin_connection_string = self.admin_connection_string.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        handle.spawn(async move {
            let Ok(mut conn) = PgConnection::connect(&admin_connection_string).await else {
                return;
            };

            let _ = sqlx::query(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid();",
            )
            .bind(&db_name)
            .execute(&mut conn)
            .await;

            let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS {}", db_name))
                .execute(&mut conn)
                .await;
        });
    }
}

async fn get_shared_postgres_context() -> &'static SharedPostgresContext {
    POSTGRES_CONTEXT
        .get_or_init(|| async {
            let container = Postgres::default()
                .with_tag("16-alpine")
                .start()
                .await
                .expect("Failed to start Postgres container");

            let host = container.get_host().await.expect("Failed to get host").to_string();
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("Failed to get port");

            let admin_connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            SharedPostgresContext {
                _container: container,
                admin_connection_string,
                host,
                port,
            }
        })
        .await
}

pub async fn get_postgres_context() -> PostgresTestDatabase {
    let ctx = get_shared_postgres_context().await;

    let db_name = format!("test_{}", Uuid::new_v4().simple());

    let mut conn = PgConnection::connect(&ctx.admin_connection_string)
        .await
        .expect("Failed to connect to postgres admin db");

    sqlx::query(&format!("CREATE DATABASE {}", db_name))
        .execute(&mut conn)
        .await
        .expect("Failed to create test database");

    PostgresTestDatabase {
        connection_string: format!(
            "postgres://postgres:postgres@{}:{}/{}",
            ctx.host, ctx.port, db_name
        ),
        db_name,
        admin_connection_string: ctx.admin_connection_string.clone(),
    }
}

/// URL of the shared Redis container
pub async fn get_redis_url() -> String {
    REDIS_CONTEXT
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("Failed to start Redis container");
            let host = container.get_host().await.expect("Failed to get host");
            let port = container
                .get_host_port_ipv4(REDIS_PORT)
                .await
                .expect("Failed to get port");

            SharedRedisContext {
                _container: container,
                url: format!("redis://{}:{}", host, port),
            }
        })
        .await
        .url
        .clone()
}
