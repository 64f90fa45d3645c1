//! Loglens: chunked storage and virtual pagination for large, growing device log datasets.

mod cli;
pub mod loglens_core;
pub mod loglens_http;
pub mod loglens_merge;
pub mod loglens_pager;
pub mod loglens_session;
pub mod loglens_storage;

pub use cli::{run, DynError};
