use rocket_db_pools::{Database, sqlx};

#[derive(Database)]
#[database("rag_db")]
pub struct RagDb(sqlx::PgPool);
