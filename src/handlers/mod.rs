pub mod models;
pub mod sessions;

pub use models::*;
pub use sessions::*;
