//! Domain types and Postgres queries for the metering & billing service.

pub mod db;
pub mod domain;
