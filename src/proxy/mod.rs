pub mod handler;
pub mod http1;

pub use handler::{ConnectionHandler, HandlerContext};
