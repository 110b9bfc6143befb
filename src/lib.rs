//! Client-side data-access core for a personal-finance ledger.
//!
//! - [`cache`]: TTL store, de-duplicating priority preloader and the
//!   cache-first accessor built on them
//! - [`pagination`]: offset pagination, sorting and filtering state
//! - [`event`] and [`sync`]: mutation events and the coordinator that turns
//!   them into invalidations
//! - [`ledger`]: the in-memory backend and its cached client

pub mod app;
pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod keys;
pub mod ledger;
pub mod logging;
pub mod pagination;
pub mod sync;
