//! Client delivery core.
//!
//! One [`session::ClientSession`] per signed-in user owns everything here:
//! the push connection ([`connection`]), the event fan-out ([`router`]), the
//! conversation and notification stores, the derived unread badges
//! ([`aggregator`]) and the [`reconciler`] that merges REST snapshots with
//! live pushes. Views read the stores through `tokio::sync::watch`
//! receivers and never mutate them directly.

pub mod aggregator;
pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod notifications;
pub mod reconciler;
pub mod router;
pub mod session;
pub mod store;

pub use aggregator::{badge_label, UnreadAggregator, UnreadTotals};
pub use api::{DeliveryApi, HttpApi};
pub use config::ClientConfig;
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionSettings, LinkState};
pub use error::ClientError;
pub use notifications::NotificationStore;
pub use reconciler::{DeliveryReconciler, PushSink, ThreadBuffer};
pub use router::{EventRouter, Subscription};
pub use session::ClientSession;
pub use store::{Conversation, ConversationStore, UpsertOutcome};
