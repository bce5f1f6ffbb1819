//! Broker abstraction
//!
//! The platform consumes AMQP 0-9-1 semantics through a small trait layer:
//! [`Broker`] opens per-host connections, [`BrokerConnection`] multiplexes
//! channels, and [`BrokerChannel`] carries the declare/bind/publish/consume
//! surface the coordinators use. Two implementations ship: the lapin-backed
//! [`amqp::AmqpBroker`] and the in-process [`memory::MemoryBroker`] used by
//! the test suite and embeddable deployments.
//!
//! Death signals are [`CancellationToken`]s: `closed()` fires when the
//! underlying connection or channel dies, and is the only thing the session
//! manager's liveness watches observe.

pub mod amqp;
pub mod exchanges;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Exchange types used by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing key equals binding key
    Direct,
    /// Dot-separated routing with `*`/`#` wildcards in bindings
    Topic,
    /// Every bound queue receives every message
    Fanout,
}

/// Queue declaration options
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    /// Only the declaring channel may consume; deleted on disconnect
    pub exclusive: bool,
    /// Deleted when the last consumer goes away
    pub auto_delete: bool,
    /// Survives a broker restart
    pub durable: bool,
}

impl QueueOptions {
    /// The options every reply queue uses
    pub fn reply_queue() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
            durable: false,
        }
    }
}

/// A message delivered to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Routing key the message was published under
    pub routing_key: String,
    /// Raw message body
    pub payload: Bytes,
}

/// Where and how a message is published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    /// Destination exchange
    pub exchange: &'static str,
    /// Routing key
    pub routing_key: String,
    /// MIME content type stamped on the message
    pub content_type: &'static str,
}

impl PublishTarget {
    /// Point-to-point reply to `server_id` on the targeted exchange
    pub fn targeted(server_id: impl Into<String>) -> Self {
        Self {
            exchange: exchanges::TARGETED,
            routing_key: server_id.into(),
            content_type: "application/json",
        }
    }

    /// Publish to the call-manager exchange under `key`
    pub fn callmgr(key: impl Into<String>) -> Self {
        Self {
            exchange: exchanges::CALLMGR,
            routing_key: key.into(),
            content_type: "application/json",
        }
    }

    /// Publish to the call-event exchange under `key`
    pub fn callevt(key: impl Into<String>) -> Self {
        Self {
            exchange: exchanges::CALLEVT,
            routing_key: key.into(),
            content_type: "application/json",
        }
    }
}

/// Handler invoked with the payload of an un-routable message
pub type ReturnHandler = Box<dyn Fn(Bytes) + Send + Sync>;

/// Factory for per-host broker connections
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Connect to the broker on `host`
    ///
    /// Connection refusal surfaces as [`crate::Error::NoBroker`].
    async fn connect(&self, host: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live connection to one broker host
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel multiplexed on this connection
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Token that fires when the connection dies
    fn closed(&self) -> CancellationToken;
}

/// A channel: the unit of broker interaction handed to client processes
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Obtain the access ticket required by the deployed broker variant
    async fn access_request(&self) -> Result<u16>;

    /// Declare an exchange of the given kind
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Declare a queue; an empty name asks the broker to generate one.
    /// Returns the actual queue name.
    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<String>;

    /// Bind `queue` to `exchange` under `routing_key`
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Delete a queue
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Publish `payload` to `target`
    async fn publish(&self, target: &PublishTarget, payload: Vec<u8>) -> Result<()>;

    /// Begin consuming from `queue`; deliveries arrive on the receiver
    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>>;

    /// Register the recipient of un-routable messages published here
    fn set_return_handler(&self, handler: ReturnHandler);

    /// Token that fires when the channel dies
    fn closed(&self) -> CancellationToken;

    /// Close the channel, releasing its queues
    async fn close(&self) -> Result<()>;
}
