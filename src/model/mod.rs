pub mod branch;
pub mod common;
pub mod content;
pub mod deploy;
pub mod job;
pub mod manifest;
pub mod user_context;

pub use branch::*;
pub use common::*;
pub use content::*;
pub use deploy::*;
pub use job::*;
pub use manifest::*;
pub use user_context::*;
