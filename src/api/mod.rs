pub mod admin;
pub mod error;
pub mod imagecache;

pub use error::ApiError;
