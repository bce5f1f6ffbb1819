//! Media request dispatching
//!
//! A single-consumer service that ingests media-fetch requests from the
//! broker, leases pre-bound TCP listener ports to streaming children, and
//! tracks live children so later requests can join an existing stream
//! instead of starting a new one. The consumer queue is rebuilt with a
//! periodic retry whenever the broker goes away.

mod config;
mod dispatcher;
mod name;
mod ports;
mod store;
mod streams;

pub use config::MediaConfig;
pub use dispatcher::{MediaDispatcher, MediaDispatcherHandle};
pub use name::MediaName;
pub use ports::{PortLease, PortPool, PortRange};
pub use store::{resolve, MediaDoc, MediaStore, MemoryMediaStore, ResolvedMedia};
pub use streams::{ChildCommand, StreamChildHandle, StreamMode, StreamStarted, StreamSupervisor};
