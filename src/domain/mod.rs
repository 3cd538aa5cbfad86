pub mod changeset;
pub mod coercion;
pub mod error;
pub mod fingerprint;
pub mod ports;
pub mod report;
pub mod retry;
pub mod schema;
pub mod snapshot;
pub mod statement;
pub mod value_objects;
