pub mod body;
pub mod request;
pub mod response;
pub mod retry;

// Re-exports for convenience
pub use body::Body;
pub use request::Request;
pub use response::{Response, ResponseBody};
pub use retry::RetryConfig;
