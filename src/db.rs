use rocket_db_pools::{Database, sqlx};

#[derive(Database)]
#[database("ngs_db")]
pub struct NgsDb(sqlx::PgPool);
