//! # Field Streaming Server Library
//!
//! This library provides the server side of the interactive FDTD field
//! streamer. Every WebSocket client gets its own isolated 3-D
//! electromagnetic simulation. Clients perturb it with input messages, and
//! the server streams back the full electric and magnetic field after each
//! solver step.
//!
//! ## Core Responsibilities
//!
//! ### Session Isolation
//! One connection drives exactly one session, and one session owns exactly
//! one solver. Sessions never share field storage, so a slow or failed
//! simulation affects only its own client.
//!
//! ### Session Registry
//! The registry is the single owner of all sessions and keeps the
//! connection <-> session mapping consistent. The maps sit behind one lock
//! that is held only for lookups and edits; each session has a lock of its
//! own for solver work. Nothing inside the registry waits on the network.
//!
//! ### Tick-Driven Streaming
//! A scheduler starts one update/broadcast cycle per period (~60 Hz):
//! - **Step**: every session is scheduled and stepped at most once, as one
//!   job per session on a worker pool
//! - **Flush**: as soon as a session's step is done, its frame is encoded
//!   and queued on the connection's bounded outbound channel; a full channel
//!   defers the frame to the next cycle instead of blocking
//! - **Sweep**: idle and failed sessions are removed
//!
//! A cycle waits at most one period for its steps. A slower step finishes
//! in the background while events and other sessions carry on.
//!
//! ## Module Organization
//!
//! ### Solver Module (`solver`)
//! The field solver interface and its interchangeable backends:
//! - `CpuFdtd`, a simplified Yee-style finite-difference update
//! - `Headless`, which only keeps time and reports zero fields
//!
//! ### Session Module (`session`)
//! One simulation's lifecycle, step cadence, pending-frame flag and expiry.
//!
//! ### Registry Module (`registry`)
//! Session creation, removal, message dispatch, tick and flush.
//!
//! ### Network Module (`network`)
//! The axum router, per-connection WebSocket tasks and the scheduler loop.
//!
//! ### Health Module (`health`)
//! Plaintext health check answering non-upgrade requests on the WebSocket
//! port.
//!
//! ### Config Module (`config`)
//! Defaults and `FDTD_*` environment overrides.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::from_env()?;
//!
//!     // Builds the session registry and binds the listener
//!     let server = Server::bind(config).await?;
//!
//!     // Serves connections and runs the tick loop until shut down
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod health;
pub mod network;
pub mod registry;
pub mod session;
pub mod solver;
