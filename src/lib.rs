//! slotd: availability and booking-conflict engine for appointment businesses,
//! served over the Postgres wire protocol.

pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod repo;
pub mod sql;
pub mod store;
pub mod time;
pub mod tls;
pub mod wal;
pub mod wire;
