#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! smshub library: the building blocks of the SMS gateway control plane.
//!
//! - `hub`: connection registry and command routing to devices
//! - `session`: per-connection read/write pumps and device authentication
//! - `protocol`: the JSON envelope spoken over the device WebSocket
//! - `router`: handlers for inbound device messages
//! - `selector`: device/SIM selection for outbound SMS
//! - `correlation`: pending command lifecycle and delivery reports
//! - `gateway`: command-sender service used by operator code
//! - `store`, `cache`, `outbox`: collaborator traits and bundled in-memory
//!   implementations
//! - `routes`: HTTP surface (health, stats, delivery reports)

pub mod auth;
pub mod cache;
pub mod config;
pub mod correlation;
pub mod gateway;
pub mod hub;
pub mod models;
pub mod outbox;
pub mod protocol;
pub mod router;
pub mod routes;
pub mod selector;
pub mod session;
pub mod state;
pub mod store;
pub mod util;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use cache::{MemoryStatusCache, StatusCache};
pub use config::Config;
pub use gateway::SmsGateway;
pub use hub::{Hub, HubError, HubStats};
pub use outbox::{EventPublisher, LogPublisher, MemoryPublisher, Outbox};
pub use state::{AppState, Tasks};
pub use store::{MemoryStore, Store};
