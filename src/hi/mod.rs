pub mod connection;
pub mod request;
pub mod service;
