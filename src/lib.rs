#[macro_use]
extern crate rocket;

pub mod config;
pub mod correlate;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod maintenance;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod request_logger;
pub mod routes;
pub mod store;

use crate::config::{ConfigVersionStore, NgsConfig};
use crate::db::NgsDb;
use crate::pipeline::Pipeline;
use crate::request_logger::RequestLogger;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};
use tokio_util::sync::CancellationToken;

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

/// Run database migrations against the managed pool.
pub async fn run_migrations(
    pool: &rocket_db_pools::sqlx::PgPool,
) -> Result<(), rocket_db_pools::sqlx::migrate::MigrateError> {
    log::info!("running database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    log::info!("database migrations completed");
    Ok(())
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    // Configure CORS
    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post, Method::Delete]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger)
        .attach(NgsDb::init())
        .attach(cors)
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite("Run Migrations", |rocket| async move {
            match NgsDb::fetch(&rocket) {
                Some(db) => {
                    let pool = (**db).clone();
                    match run_migrations(&pool).await {
                        Ok(_) => Ok(rocket),
                        Err(e) => {
                            log::error!("database migrations failed: {}", e);
                            Err(rocket)
                        }
                    }
                }
                None => {
                    log::error!("database pool not available for migrations");
                    Err(rocket)
                }
            }
        }))
        // Load config, version it, and assemble the pipeline services
        .attach(AdHoc::try_on_ignite("Build Pipeline", |rocket| async move {
            let pool = match NgsDb::fetch(&rocket) {
                Some(db) => (**db).clone(),
                None => {
                    log::error!("database pool not available for pipeline");
                    return Err(rocket);
                }
            };

            let ngs_config = match NgsConfig::from_env() {
                Ok(config) => config,
                Err(e) => {
                    log::error!("configuration rejected: {}", e);
                    return Err(rocket);
                }
            };

            // Persist the accepted rules document as the active
            // version before the pipeline starts consuming it.
            let versions = ConfigVersionStore::new(pool.clone());
            if let Err(e) = versions.activate(&ngs_config.rules).await {
                log::error!("failed to store config version: {}", e);
                return Err(rocket);
            }

            let pipeline = match Pipeline::new(pool.clone(), ngs_config) {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    log::error!("failed to assemble pipeline: {}", e);
                    return Err(rocket);
                }
            };

            Ok(rocket
                .manage(pool)
                .manage(pipeline)
                .manage(CancellationToken::new()))
        }))
        // Spawn the background workers once the server is live
        .attach(AdHoc::on_liftoff("Spawn Pipeline Workers", |rocket| {
            Box::pin(async move {
                let pool = rocket.state::<rocket_db_pools::sqlx::PgPool>().cloned();
                let pipeline = rocket.state::<Arc<Pipeline>>().cloned();
                let token = rocket.state::<CancellationToken>().cloned();

                let (Some(pool), Some(pipeline), Some(token)) = (pool, pipeline, token) else {
                    log::error!("pipeline state missing; background workers not started");
                    return;
                };

                log::info!("starting pipeline workers");
                let handles = pipeline.spawn(pool, token.clone());

                // Shutdown coordinator: cancel every worker when the
                // server stops, then await them all.
                let shutdown = rocket.shutdown();
                tokio::spawn(async move {
                    shutdown.await;
                    log::info!("shutdown requested, stopping pipeline workers");
                    token.cancel();
                    for handle in handles {
                        if let Err(e) = handle.await {
                            log::warn!("worker task ended abnormally: {}", e);
                        }
                    }
                    log::info!("all pipeline workers stopped");
                });
            })
        }))
        .mount(
            "/api/v1",
            openapi_get_routes![
                // Health
                routes::health::live_health,
                routes::health::ready_health,
                // Incidents
                routes::incidents::list_incidents,
                routes::incidents::get_incident,
                // Quarantine
                routes::quarantine::list_quarantine,
                routes::quarantine::review_quarantine,
                // Dead letters
                routes::dlq::list_dead_letters,
                routes::dlq::redispatch_dead_letter,
                // Maintenance windows
                routes::maintenance::list_windows,
                routes::maintenance::create_window,
                routes::maintenance::deactivate_window,
                // Ingestion status
                routes::ingest::list_cursors,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("NGS API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    pub use database::{TestDatabase, TestDatabaseError};

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::{GenericImage, ImageExt, core::WaitFor};
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database factory for integration tests. Launches a
        /// disposable Postgres container and creates one fresh database
        /// per test.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<GenericImage>>,
        }

        impl TestDatabase {
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                Self::new().await
            }

            pub async fn new() -> Result<Self, TestDatabaseError> {
                let image = GenericImage::new("postgres", "16-alpine")
                    .with_wait_for(WaitFor::message_on_stdout(
                        "database system is ready to accept connections",
                    ))
                    .with_wait_for(WaitFor::message_on_stderr(
                        "database system is ready to accept connections",
                    ));

                let request = image
                    .with_env_var("POSTGRES_DB", "postgres")
                    .with_env_var("POSTGRES_USER", "postgres")
                    .with_env_var("POSTGRES_PASSWORD", "postgres");

                let container = request.start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let base_options: PgConnectOptions =
                    admin_url.parse().map_err(TestDatabaseError::Sqlx)?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let new_db_name = format!("ngs_test_{}", Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql)
                    .execute(&admin_pool)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(base_options.clone().database(&new_db_name))
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container: Some(container),
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database(self.admin_options.clone(), &self.database_name)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", database_name);
            sqlx::query(&drop_sql).execute(&admin_pool).await?;
            Ok(())
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database(admin_options, &db_name).await;
                        });
                    } else {
                        std::thread::spawn(move || {
                            if let Ok(rt) = tokio::runtime::Runtime::new() {
                                rt.block_on(async move {
                                    pool.close().await;
                                    let _ = drop_database(admin_options, &db_name).await;
                                });
                            }
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }
}
