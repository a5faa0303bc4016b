//! Persistence layer for the mender workflow engine.
//!
//! Exposes the connection pool, migrations, row models, and the query
//! functions the engine components use to mutate workflow and task state.
//! All status transitions are conditional updates keyed on the expected
//! prior status, so concurrent actors coordinate through the database
//! rather than in-process locks.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
