//! Travel Inbox: email processing orchestration for a travel-booking business.

pub mod config;
pub mod error;
pub mod inventory;
pub mod matching;
pub mod pipeline;
pub mod queue;
pub mod review;
pub mod store;
pub mod tenant;

pub use error::{Error, Result};
