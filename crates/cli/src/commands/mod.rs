pub mod executions;
pub mod run;
pub mod stale;
pub mod summary;
pub mod validate;
