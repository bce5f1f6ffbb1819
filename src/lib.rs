//! Broker integration core for a call-management platform
//!
//! Three long-running services mediate traffic between application
//! processes and a shared AMQP 0-9-1 broker:
//!
//! - [`session::SessionManager`] owns per-host connections, opens and
//!   tracks channels on behalf of client processes, and tears everything
//!   down when the peer, the channel, or the host dies.
//! - [`pool::Pool`] serves outbound request/response transactions through
//!   an elastic set of workers, each holding an exclusive reply queue.
//! - [`media::MediaDispatcher`] consumes media-fetch requests, leases
//!   pre-bound TCP listener ports to streaming children, and lets later
//!   requests join a stream that is already running.
//!
//! # Architecture
//!
//! ```text
//!   application code                     broker host(s)
//!        │                                    ▲
//!        ▼                                    │
//!   PoolHandle ──► Pool ──► workers ──────────┤   channels via
//!        │                  (reply queues)    │   SessionManager
//!        │                                    │
//!   media requests ──► MediaDispatcher ───────┘
//!                        │        │
//!                     PortPool  StreamTable ──► stream children
//! ```
//!
//! All three coordinators are single tasks over typed mailboxes; anything
//! that can block runs in its own task. Every stored handle is paired with
//! a liveness watch, and the watch firing is the only teardown trigger.

pub mod broker;
pub mod client;
pub mod envelope;
pub mod error;
pub mod media;
pub mod pool;
pub mod session;

mod watch;

pub use broker::{Broker, BrokerChannel, BrokerConnection, Delivery, PublishTarget};
pub use client::{ClientGuard, ClientHandle, ClientNotice};
pub use envelope::{Envelope, RequestKind};
pub use error::{Error, Result};
pub use media::{MediaConfig, MediaDispatcher, MediaDispatcherHandle};
pub use pool::{CallKind, Pool, PoolConfig, PoolHandle};
pub use session::{OpenedChannel, SessionManager, SessionManagerHandle};
