pub mod app_state;
pub mod auth;
pub mod billing;
pub mod db;
pub mod events;
pub mod handlers;
pub mod policy;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod utils;
