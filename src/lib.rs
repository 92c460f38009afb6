//! # worker-bridge
//!
//! Supervised request/response bridge to a long-lived worker process.
//!
//! A host application talks to one external worker (typically an
//! interpreter doing CPU-heavy analysis) over the worker's stdio pipes. Many
//! concurrent requests are multiplexed over the pipe pair and matched to
//! responses by id.
//!
//! ## Architecture
//!
//! - **Requests** (stdin): one JSON object per line, `{"id", "command", ...}`
//! - **Responses** (stdout): a JSON object, possibly spanning lines, followed
//!   by the `__END__` sentinel
//! - **Supervision**: crash detection, bounded automatic restarts, periodic
//!   memory and liveness checks, and recycling after a service quota
//!
//! ## Example
//!
//! ```no_run
//! use serde_json::json;
//! use worker_bridge::BridgeBuilder;
//!
//! #[tokio::main]
//! async fn main() -> worker_bridge::Result<()> {
//!     let bridge = BridgeBuilder::python("python_server.py").build();
//!
//!     let result = bridge
//!         .send_command("extract_text", json!({"image_data": "..."}))
//!         .await?;
//!     println!("{}", result);
//!
//!     bridge.stop().await
//! }
//! ```

pub mod error;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod writer;

mod bridge;
mod config;
mod monitor;
mod supervisor;

pub use bridge::Bridge;
pub use config::{BridgeBuilder, BridgeConfig, HealthConfig, PoolConfig, ReclaimHook};
pub use error::{BridgeError, Result};
pub use supervisor::{BridgeStatus, WorkerState};
