//! Per-host session state
//!
//! One [`HostEntry`] per connected broker host, each holding the channels
//! opened for client processes on that host. Every stored handle is paired
//! with a live watch; teardown cancels the watches before the handle goes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::{BrokerChannel, BrokerConnection};
use crate::client::ClientHandle;
use crate::watch::Watch;

/// State for one broker host
pub(super) struct HostEntry {
    /// The single connection multiplexing all channels for this host
    pub connection: Arc<dyn BrokerConnection>,
    /// Watch on the connection's death token
    pub watch: Watch,
    /// Channels keyed by client-process id, at most one per client
    pub channels: HashMap<String, ChannelEntry>,
}

/// A channel opened for one client process
pub(super) struct ChannelEntry {
    pub client: ClientHandle,
    pub channel: Arc<dyn BrokerChannel>,
    pub ticket: u16,
    pub channel_watch: Watch,
    pub client_watch: Watch,
}

impl ChannelEntry {
    /// Cancel both watches and shut the channel in the background
    pub fn teardown(self) {
        self.channel_watch.cancel();
        self.client_watch.cancel();
        let channel = self.channel;
        tokio::spawn(async move {
            let _ = channel.close().await;
        });
    }
}
