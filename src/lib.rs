//! Class and teacher timetabling behind the Postgres wire protocol.
//!
//! Bookings live in memory, indexed per (academic year, day, resource), and
//! every committed change is appended to a write-ahead log before it is
//! applied. Double-booking a class or a teacher is rejected at write time.

pub mod auth;
pub mod compactor;
pub mod config;
pub mod directory;
pub mod engine;
pub mod index;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
