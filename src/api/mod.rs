pub mod branch_handlers;
pub mod handlers;
pub mod routes;
pub mod serve_handlers;
pub mod user_extractor;

pub use branch_handlers::*;
pub use handlers::*;
pub use routes::*;
pub use serve_handlers::*;
