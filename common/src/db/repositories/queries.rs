// SQL query constants for repositories
// Centralizes repeated SELECT column lists

/// SQL query fragments for scheduled_jobs table
pub mod job_queries {
    /// Table holding one row per unit of work
    pub const TABLE: &str = "scheduled_jobs";

    /// Control block columns, matching `JobRecord`
    pub const RECORD_COLUMNS: &str = r#"id, kind, created_at, updated_at, queued_at,
        in_progressed_at, status, retry_count, failure_message"#;
}
