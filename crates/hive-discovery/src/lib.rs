//! # hive-discovery
//!
//! Gateway discovery for hive clients.
//!
//! A client keeps a set of known gateways, only some of which are healthy
//! at any moment. This crate tracks that set:
//!
//! - **Live list** — the ordered gateways currently eligible for traffic
//! - **Quarantine** — gateways marked dead are benched for a configurable
//!   period, then periodically returned to the live list
//! - **Selection** — a pseudo-random live pick for callers that do not
//!   care which gateway answers
//!
//! ```rust
//! use hive_discovery::{GatewayConfig, GatewayManager};
//! use hive_proto::GatewayUri;
//!
//! let manager = GatewayManager::new(
//!     GatewayConfig::default(),
//!     vec![
//!         GatewayUri::new("ws://10.0.0.1:18789"),
//!         GatewayUri::new("ws://10.0.0.2:18789"),
//!     ],
//! );
//!
//! let picked = manager.select().expect("a live gateway");
//! manager.mark_dead(&picked);
//! assert_eq!(manager.live_count(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod manager;

pub use manager::{DiscoveryError, GatewayConfig, GatewayListener, GatewayManager};
