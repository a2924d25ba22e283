pub mod alerts;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod model;
pub mod normalize;
pub mod notify;
pub mod outbox;
pub mod ratelimit;
pub mod reconcile;
pub mod scheduler;
pub mod shutdown;
pub mod sources;
