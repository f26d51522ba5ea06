//! Availability and scheduling core of a booking system, served over the
//! Postgres wire protocol. Each database name is an isolated tenant with its
//! own write-ahead log.

pub mod auth;
pub mod background;
pub mod busy;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod feed;
pub mod limits;
pub mod model;
pub mod observability;
pub mod outbox;
pub mod overlap;
pub mod schedule;
pub mod slots;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
