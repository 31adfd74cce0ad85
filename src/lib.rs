pub mod api_router;
pub mod audit;
pub mod auth;
pub mod config;
pub mod departments;
pub mod directory;
pub mod goals;
pub mod maintenance;
pub mod metrics;
pub mod notify;
pub mod requests;
pub mod schema;
pub mod shared;
