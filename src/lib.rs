pub mod api;
pub mod config;
pub mod models;
pub mod services;
pub mod storage;
pub mod validation;

pub use api::handlers::AppState;
pub use api::middleware::AppError;
pub use models::*;
pub use services::*;
pub use validation::*;
