//! Nostr relay pool, subscription multiplexer and signing pipeline.
//!
//! - one background task per relay, with backoff reconnect and subscription replay
//! - a registry that folds identical filter sequences onto one wire subscription and
//!   delivers each verified event at most once per listener
//! - local or remote (kind 24133) signing, and moderation report submission on top

pub mod backoff;
pub mod config;
pub mod error;
pub mod message;
pub mod mux;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod relay_url;
pub mod remote_signer;
pub mod report;
pub mod signer;
pub mod transport;

pub use config::{ENV_RELAYS, MuxConfig};
pub use error::{ClientError, PublishError, ReportError, Result, SignError};
pub use message::{ClientMessage, RelayMessage, parse_relay_message};
pub use mux::{NostrMux, SignerSetup};
pub use pool::{PoolConfig, RelayPool};
pub use registry::{
    Delivery, EventCallback, RegistryConfig, SubscriptionHandle, SubscriptionRegistry,
};
pub use relay::{ConnectionState, InboundEvent, PublishAck, RelayConfig, RelayConnection};
pub use relay_url::{normalize_relay_url, parse_relay_list, parse_relays};
pub use remote_signer::{RemoteSignerClient, RemoteSignerConfig};
pub use report::{HttpReportMirror, ReportMirror, ReportSubmitter, SubmittedReport};
pub use signer::{SigningMethod, SigningPipeline, sign};
pub use transport::{PublishOutcome, PublishReport, RelayTransport};
