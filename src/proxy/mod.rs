pub mod aggregate;
pub mod context;
pub mod dispatch;
mod handler;

pub use context::BoxBody;
pub use handler::handle_request;
