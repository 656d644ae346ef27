pub mod api;
pub mod backfill;
pub mod chain;
pub mod cid;
pub mod client;
pub mod constants;
pub mod content_store;
pub mod filter;
pub mod index;
pub mod ipld_fetcher;
pub mod payload;
pub mod publisher;
pub mod queue;
pub mod server;
pub mod service;
pub mod subscription;
pub mod upstream;
