mod api;
mod service;

pub mod helpers;
