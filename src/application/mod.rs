pub mod apply;
pub mod detect;
pub mod diff;
pub mod monitoring;
pub mod reconcile;
pub mod registry;
pub mod sync;
