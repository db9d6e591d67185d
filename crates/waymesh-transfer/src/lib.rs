//! Waymesh Transfer - Overlay transport
//!
//! This crate provides:
//! - The [`Overlay`] / [`Session`] seam the node is written against
//! - [`UdpOverlay`]: UDP datagrams with tuned socket buffers, TCP sessions
//! - [`MemoryOverlay`]: in-process network with fault injection
//! - [`send_with_retry`]: bounded exponential backoff for transient failures
//! - [`SessionPool`]: one reliable session per peer, relay as last resort
//!
//! # Delivery
//!
//! Datagrams are best-effort and unordered. Sessions are ordered but may die
//! at any time; callers check [`Session::is_alive`] or simply reopen through
//! the pool.
//!
//! # Example
//!
//! ```rust,ignore
//! use waymesh_transfer::{UdpConfig, UdpOverlay, Overlay};
//!
//! let (overlay, mut inbound) = UdpOverlay::bind(UdpConfig::default(), key).await?;
//! overlay.send(&peer_address, b"{\"type\":\"hb\",...}").await?;
//! while let Some(msg) = inbound.recv().await {
//!     println!("{} sent {} bytes", msg.src, msg.payload.len());
//! }
//! ```

mod error;
mod memory;
mod overlay;
mod retry;
mod session;
mod udp;

pub use error::{Result, SendError};
pub use memory::{MemoryNetwork, MemoryOverlay};
pub use overlay::{Inbound, Overlay, Session};
pub use retry::{send_with_retry, RetryPolicy};
pub use session::SessionPool;
pub use udp::{route, UdpConfig, UdpOverlay, MAX_DATAGRAM, MAX_FRAME};
