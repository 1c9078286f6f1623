pub mod client;
pub mod in_process;
pub mod traits;

pub use client::TaskClient;
pub use in_process::InProcessTransport;
pub use traits::{MessageHandler, Transport};
