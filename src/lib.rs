pub mod capture;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod state;
pub mod tls;

pub use capture::{CaptureStore, CapturedExchange};
pub use error::{ProxyError, Result};
pub use server::ProxyController;
pub use state::{ProxyState, ProxyStatus};
