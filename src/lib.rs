//! db-throttle - Database-backed distributed locks and rate limiting
//!
//! This crate implements a lock store and a rate limiter state store on top
//! of a shared relational database. Every process pointing at the same
//! database sees the same locks and the same limiter state; mutual exclusion
//! comes from database row locks and conditional updates alone.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod ratelimit;
pub mod registry;
pub mod service;
