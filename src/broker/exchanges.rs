//! The fixed exchange set
//!
//! Every channel the session manager opens declares these exchanges with
//! their stable types, so any client process can publish or bind without
//! caring who came up first.

use super::{BrokerChannel, ExchangeKind};
use crate::error::Result;

/// Direct exchange for point-to-point replies; routing key is the
/// consumer's server-id
pub const TARGETED: &str = "targeted";
/// Direct exchange for call-control commands
pub const CALLCTL: &str = "callctl";
/// Topic exchange for call events and media requests
pub const CALLEVT: &str = "callevt";
/// Fanout exchange for cluster-wide broadcasts
pub const BROADCAST: &str = "broadcast";
/// Topic exchange for call-manager requests
pub const CALLMGR: &str = "callmgr";
/// Topic exchange for monitoring traffic
pub const MONITOR: &str = "monitor";

/// Routing key media requests are published and bound under
pub const MEDIA_REQ_KEY: &str = "media_req";

/// The exchanges and their stable types
pub const KNOWN_EXCHANGES: &[(&str, ExchangeKind)] = &[
    (TARGETED, ExchangeKind::Direct),
    (CALLCTL, ExchangeKind::Direct),
    (CALLEVT, ExchangeKind::Topic),
    (BROADCAST, ExchangeKind::Fanout),
    (CALLMGR, ExchangeKind::Topic),
    (MONITOR, ExchangeKind::Topic),
];

/// Declare the full known exchange set on `channel`
pub async fn declare_known_exchanges(channel: &dyn BrokerChannel) -> Result<()> {
    for (name, kind) in KNOWN_EXCHANGES {
        channel.declare_exchange(name, *kind).await?;
    }
    Ok(())
}
