//! promptdeck-bridge: request/response and event multiplexer over a worker
//! subprocess byte stream.
//!
//! The Promptdeck host (UI) process drives a long-lived worker that performs
//! filesystem scans, token counting, and persistent entity storage. This
//! crate is the seam between the two:
//!
//! - **protocol**: wire message types (newline-delimited JSON)
//! - **codec**: framing codec for AsyncRead/AsyncWrite
//! - **mux**: correlation ids, deadlines, event fan-out
//! - **supervisor**: worker process lifecycle and the bridge event loop
//! - **bridge**: the public facade ([`Bridge::start`], [`Bridge::call`],
//!   named wrappers)
//!
//! ```no_run
//! use promptdeck_bridge::{Bridge, WorkerConfig};
//!
//! # async fn example() -> Result<(), promptdeck_bridge::BridgeError> {
//! let config = WorkerConfig::new("/usr/bin/python3")
//!     .with_args(["-u", "worker/main.py"]);
//! let bridge = Bridge::start(config).await?;
//!
//! let count = bridge.count_tokens("hello world").await?;
//! let tree = bridge.call("project/get_tree", serde_json::json!({})).await?;
//! bridge.stop().await?;
//! # let _ = (count, tree);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod supervisor;

mod mux;

pub use bridge::Bridge;
pub use error::BridgeError;
pub use protocol::{Message, Notification, Request, Response};
pub use supervisor::{BridgeState, CommandSpawner, SpawnError, WorkerConfig, WorkerSpawner};
