//! Session manager coordinator
//!
//! A single task serializes every operation on the host table. Liveness
//! watches feed death events back into the same mailbox, so teardown of a
//! dying resource is complete before the next unrelated command runs.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::entry::{ChannelEntry, HostEntry};
use crate::broker::exchanges::declare_known_exchanges;
use crate::broker::{Broker, BrokerChannel, BrokerConnection};
use crate::client::{ClientHandle, ClientNotice};
use crate::error::{Error, Result};
use crate::watch::Watch;

/// Cluster node names carry this prefix in node-down notifications
const NODE_PREFIX: &str = "rabbit@";

/// A channel opened by the session manager, plus its access ticket
#[derive(Clone)]
pub struct OpenedChannel {
    /// The channel handle, owned by the requesting client
    pub channel: Arc<dyn BrokerChannel>,
    /// Access ticket obtained at channel open
    pub ticket: u16,
}

enum SessionCommand {
    IsAvailable {
        host: String,
        reply: oneshot::Sender<bool>,
    },
    OpenChannel {
        client: ClientHandle,
        host: String,
        reply: oneshot::Sender<Result<OpenedChannel>>,
    },
    CloseChannel {
        client_id: String,
        host: String,
    },
    Down(DownEvent),
    NodeDown {
        node: String,
    },
}

enum DownEvent {
    Connection { host: String },
    Channel { host: String, client_id: String },
    Client { host: String, client_id: String },
}

/// Handle to the session manager, cheap to clone
#[derive(Clone)]
pub struct SessionManagerHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionManagerHandle {
    /// Whether a live connection to `host` exists or can be created
    ///
    /// Connection refusal answers `false` without raising.
    pub async fn is_available(&self, host: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SessionCommand::IsAvailable {
                host: host.to_string(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Open (or return the existing) channel for `(client, host)`
    pub async fn open_channel(&self, client: &ClientHandle, host: &str) -> Result<OpenedChannel> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::OpenChannel {
                client: client.clone(),
                host: host.to_string(),
                reply,
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Close the channel held for `(client_id, host)`, if any
    ///
    /// Asynchronous; unknown targets are logged and ignored.
    pub fn close_channel(&self, client_id: &str, host: &str) {
        let _ = self.tx.send(SessionCommand::CloseChannel {
            client_id: client_id.to_string(),
            host: host.to_string(),
        });
    }

    /// Feed a cluster node-down notification (`rabbit@<host>`)
    pub fn node_down(&self, node: &str) {
        let _ = self.tx.send(SessionCommand::NodeDown {
            node: node.to_string(),
        });
    }
}

/// The broker session manager
pub struct SessionManager;

impl SessionManager {
    /// Spawn the coordinator task over `broker`
    pub fn spawn(broker: Arc<dyn Broker>) -> SessionManagerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            broker,
            hosts: HashMap::new(),
            tx: tx.clone(),
        };
        tokio::spawn(coordinator.run(rx));
        SessionManagerHandle { tx }
    }
}

struct Coordinator {
    broker: Arc<dyn Broker>,
    hosts: HashMap<String, HostEntry>,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                SessionCommand::IsAvailable { host, reply } => {
                    let available = self.ensure_connection(&host).await.is_ok();
                    let _ = reply.send(available);
                }
                SessionCommand::OpenChannel {
                    client,
                    host,
                    reply,
                } => {
                    let _ = reply.send(self.open_channel(client, &host).await);
                }
                SessionCommand::CloseChannel { client_id, host } => {
                    self.close_channel(&client_id, &host);
                }
                SessionCommand::Down(event) => self.handle_down(event).await,
                SessionCommand::NodeDown { node } => {
                    let host = node.strip_prefix(NODE_PREFIX).unwrap_or(&node).to_string();
                    tracing::warn!(node = %node, host = %host, "broker node down");
                    self.connection_down(&host);
                }
            }
        }
    }

    /// Connection for `host`, opening one on first demand
    async fn ensure_connection(&mut self, host: &str) -> Result<Arc<dyn BrokerConnection>> {
        match self.hosts.entry(host.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().connection.clone()),
            Entry::Vacant(slot) => {
                let connection = match self.broker.connect(host).await {
                    Ok(connection) => connection,
                    Err(err) => {
                        tracing::debug!(host, error = %err, "broker connection refused");
                        return Err(Error::NoBroker);
                    }
                };
                let watch = {
                    let tx = self.tx.clone();
                    let host = host.to_string();
                    Watch::spawn(connection.closed(), move || {
                        let _ = tx.send(SessionCommand::Down(DownEvent::Connection { host }));
                    })
                };
                tracing::info!(host, "broker connection opened");
                let entry = slot.insert(HostEntry {
                    connection,
                    watch,
                    channels: HashMap::new(),
                });
                Ok(entry.connection.clone())
            }
        }
    }

    async fn open_channel(&mut self, client: ClientHandle, host: &str) -> Result<OpenedChannel> {
        if let Some(existing) = self
            .hosts
            .get(host)
            .and_then(|entry| entry.channels.get(client.id()))
        {
            return Ok(OpenedChannel {
                channel: existing.channel.clone(),
                ticket: existing.ticket,
            });
        }

        let connection = self.ensure_connection(host).await?;
        let entry = self.build_channel(&connection, &client, host).await?;
        let opened = OpenedChannel {
            channel: entry.channel.clone(),
            ticket: entry.ticket,
        };
        if let Some(host_entry) = self.hosts.get_mut(host) {
            tracing::info!(host, client = client.id(), ticket = entry.ticket, "channel opened");
            host_entry.channels.insert(client.id().to_string(), entry);
        }
        Ok(opened)
    }

    /// The channel-open protocol: open, register the client as the return
    /// handler, obtain the access ticket, declare the known exchanges,
    /// install the watches.
    async fn build_channel(
        &self,
        connection: &Arc<dyn BrokerConnection>,
        client: &ClientHandle,
        host: &str,
    ) -> Result<ChannelEntry> {
        let channel = connection
            .open_channel()
            .await
            .map_err(|err| Error::ChannelOpenFailed(err.to_string()))?;

        let return_client = client.clone();
        channel.set_return_handler(Box::new(move |payload| {
            return_client.notify(ClientNotice::Returned(payload));
        }));

        let ticket = channel
            .access_request()
            .await
            .map_err(|err| Error::ChannelOpenFailed(err.to_string()))?;
        declare_known_exchanges(channel.as_ref())
            .await
            .map_err(|err| Error::ChannelOpenFailed(err.to_string()))?;

        let channel_watch = {
            let tx = self.tx.clone();
            let host = host.to_string();
            let client_id = client.id().to_string();
            Watch::spawn(channel.closed(), move || {
                let _ = tx.send(SessionCommand::Down(DownEvent::Channel { host, client_id }));
            })
        };
        let client_watch = {
            let tx = self.tx.clone();
            let host = host.to_string();
            let client_id = client.id().to_string();
            Watch::spawn(client.alive_token(), move || {
                let _ = tx.send(SessionCommand::Down(DownEvent::Client { host, client_id }));
            })
        };

        Ok(ChannelEntry {
            client: client.clone(),
            channel,
            ticket,
            channel_watch,
            client_watch,
        })
    }

    fn close_channel(&mut self, client_id: &str, host: &str) {
        match self
            .hosts
            .get_mut(host)
            .and_then(|entry| entry.channels.remove(client_id))
        {
            Some(entry) => {
                tracing::info!(host, client = client_id, "channel closed");
                entry.teardown();
            }
            None => {
                tracing::debug!(host, client = client_id, "close for unknown channel ignored");
            }
        }
    }

    async fn handle_down(&mut self, event: DownEvent) {
        match event {
            DownEvent::Connection { host } => self.connection_down(&host),
            DownEvent::Channel { host, client_id } => self.channel_down(&host, &client_id).await,
            DownEvent::Client { host, client_id } => {
                tracing::info!(host = %host, client = %client_id, "client went away");
                self.close_channel(&client_id, &host);
            }
        }
    }

    /// Destroy the whole host entry and notify every still-live client
    fn connection_down(&mut self, host: &str) {
        let Some(entry) = self.hosts.remove(host) else {
            tracing::debug!(host, "connection-down for unknown host ignored");
            return;
        };
        entry.watch.cancel();
        let channels = entry.channels.len();
        for (_, channel_entry) in entry.channels {
            let client = channel_entry.client.clone();
            channel_entry.teardown();
            if client.is_alive() {
                client.notify(ClientNotice::BrokerHostDown(host.to_string()));
            }
        }
        tracing::warn!(host, channels, "broker host down, tore down all channels");
    }

    /// Channel died; if the client is still alive, rebuild it in place
    async fn channel_down(&mut self, host: &str, client_id: &str) {
        let Some(old) = self
            .hosts
            .get_mut(host)
            .and_then(|entry| entry.channels.remove(client_id))
        else {
            tracing::debug!(host, client = client_id, "channel-down for unknown channel ignored");
            return;
        };
        old.channel_watch.cancel();
        old.client_watch.cancel();

        let client = old.client.clone();
        if !client.is_alive() {
            return;
        }
        let Some(connection) = self.hosts.get(host).map(|entry| entry.connection.clone()) else {
            return;
        };
        match self.build_channel(&connection, &client, host).await {
            Ok(entry) => {
                tracing::info!(host, client = client_id, "channel reopened after death");
                if let Some(host_entry) = self.hosts.get_mut(host) {
                    host_entry.channels.insert(client_id.to_string(), entry);
                }
            }
            Err(err) => {
                tracing::warn!(host, client = client_id, error = %err, "channel reopen failed");
            }
        }
    }
}
