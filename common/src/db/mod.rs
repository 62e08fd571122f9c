// Database layer module
// PostgreSQL connection pool, migrations and the sqlx-backed job store

pub mod pool;
pub mod repositories;

pub use pool::DbPool;
pub use repositories::JobRepository;
