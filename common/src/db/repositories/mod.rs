// Repository layer for database operations

pub mod job;
mod queries;

pub use job::JobRepository;
