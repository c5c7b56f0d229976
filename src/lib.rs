//! Fetches a page of items from a public REST API and prints the raw
//! response.

pub mod cli;
pub mod fetch;
pub mod http;
