pub mod config;
pub mod engine;
pub mod hours;
pub mod index;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod sweeper;
pub mod tls;
pub mod waitlist;
pub mod wire;
