pub mod cielo;
pub mod config;
pub mod db;
pub mod gmgn;
pub mod observability;
pub mod proxy_pool;
pub mod resilience;
pub mod store;
pub mod types;
pub mod validator;
