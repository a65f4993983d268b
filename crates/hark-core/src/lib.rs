//! # hark-core
//!
//! Presence tracking and signaling relay for the Hark server.
//!
//! This crate provides the building blocks behind every connection:
//!
//! - **Presence** - Bidirectional user ↔ connection registry
//! - **Router** - Stateless point-to-point relay of chat and call signaling
//! - **Hub** - Connection lifecycle, registration, and status broadcasts
//! - **Store** - User store collaborator and an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│     Hub     │────▶│   Router    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │       │               │ reads
//!                        ▼       ▼               ▼
//!               ┌───────────┐  ┌─────────────────────┐
//!               │ UserStore │  │  PresenceRegistry   │
//!               └───────────┘  └─────────────────────┘
//! ```

pub mod hub;
pub mod ids;
pub mod presence;
pub mod router;
pub mod store;

pub use hub::{EventReceiver, Hub, HubConfig, HubStats, Outcome, Session, SessionState};
pub use ids::{ConnectionId, UserId};
pub use presence::{Generation, PresenceRegistry, Registration};
pub use router::{Delivery, RelayError, RelayKind, RelayRequest, SignalingRouter};
pub use store::{MemoryUserStore, StoreError, User, UserStore};
