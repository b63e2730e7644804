#[macro_use]
extern crate diesel;

pub mod api;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod identity;
pub mod models;
pub mod queue;
pub mod schema;
pub mod service;
pub mod waitlist;
