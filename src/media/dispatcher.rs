//! Media dispatcher coordinator
//!
//! One task owns the consumer queue, the reserved-port pool, and the
//! streams table. Each consumed request is handled in its own task so the
//! consumer loop never blocks on document lookups or child startup; the
//! handler talks back to the coordinator only through the mailbox.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::config::MediaConfig;
use super::ports::{PortLease, PortPool};
use super::store::{resolve, MediaStore};
use super::streams::{StreamChildHandle, StreamMode, StreamSupervisor, StreamTable};
use crate::broker::exchanges::{CALLEVT, CALLMGR, MEDIA_REQ_KEY, TARGETED};
use crate::broker::{BrokerChannel, Delivery, ExchangeKind, PublishTarget, QueueOptions};
use crate::client::{ClientGuard, ClientHandle, ClientNotice};
use crate::envelope::{
    Envelope, RequestKind, ERROR_CODE, ERROR_MSG, MEDIA_NAME, SERVER_ID, STREAM_TYPE, STREAM_URL,
};
use crate::error::{Error, Result};
use crate::session::SessionManagerHandle;
use crate::watch::Watch;

enum MediaCommand {
    AddStream {
        media_id: String,
        child: StreamChildHandle,
    },
    NextPort {
        reply: oneshot::Sender<Result<PortLease>>,
    },
    LookupStream {
        media_id: String,
        reply: oneshot::Sender<Option<StreamChildHandle>>,
    },
    Bootstrap,
    Incoming(Delivery),
    Dispatched,
    StreamDown {
        media_id: String,
        child_id: u64,
    },
    ChannelDown,
    HostDown(String),
}

/// The consumer queue identity, or the failure marker while retrying
enum ConsumerState {
    Starting,
    Active(String),
    Failed { last_queue: Option<String> },
}

impl ConsumerState {
    fn queue_name(&self) -> Option<String> {
        match self {
            ConsumerState::Active(queue) => Some(queue.clone()),
            ConsumerState::Failed { last_queue } => last_queue.clone(),
            ConsumerState::Starting => None,
        }
    }
}

/// Handle to the media dispatcher, cheap to clone
#[derive(Clone)]
pub struct MediaDispatcherHandle {
    tx: mpsc::UnboundedSender<MediaCommand>,
}

impl MediaDispatcherHandle {
    /// Register a live streaming child for future join requests
    pub fn add_stream(&self, media_id: impl Into<String>, child: StreamChildHandle) {
        let _ = self.tx.send(MediaCommand::AddStream {
            media_id: media_id.into(),
            child,
        });
    }

    /// Lease the next reserved port
    pub async fn next_port(&self) -> Result<PortLease> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MediaCommand::NextPort { reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

/// The media request dispatcher
pub struct MediaDispatcher;

impl MediaDispatcher {
    /// Spawn the coordinator task
    ///
    /// Broker interaction starts with the first bootstrap tick; a broker
    /// that is down at startup is retried on the configured interval.
    pub fn spawn(
        config: MediaConfig,
        session: SessionManagerHandle,
        store: Arc<dyn MediaStore>,
        supervisor: Arc<dyn StreamSupervisor>,
    ) -> MediaDispatcherHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (client, client_guard, mut notices) = ClientHandle::new(config.server_id.clone());

        // pump client notices into the mailbox
        let notice_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                match notice {
                    ClientNotice::BrokerHostDown(host) => {
                        if notice_tx.send(MediaCommand::HostDown(host)).is_err() {
                            break;
                        }
                    }
                    ClientNotice::Returned(_) => {
                        tracing::debug!("unroutable media reply returned");
                    }
                }
            }
        });

        let ports = PortPool::new(config.bind_ip, config.port_range, config.max_reserved_ports);
        let coordinator = Coordinator {
            config,
            session,
            store,
            supervisor,
            client,
            _client_guard: client_guard,
            channel: None,
            channel_watch: None,
            consumer: ConsumerState::Starting,
            broker_up: false,
            ports,
            streams: StreamTable::new(),
            retry_scheduled: false,
            tx: tx.clone(),
        };
        // the startup one-shot that bootstraps the consumer and port pool
        let _ = tx.send(MediaCommand::Bootstrap);
        tokio::spawn(coordinator.run(rx));

        MediaDispatcherHandle { tx }
    }
}

struct Coordinator {
    config: MediaConfig,
    session: SessionManagerHandle,
    store: Arc<dyn MediaStore>,
    supervisor: Arc<dyn StreamSupervisor>,
    client: ClientHandle,
    _client_guard: ClientGuard,
    channel: Option<Arc<dyn BrokerChannel>>,
    /// Watch on the current channel's death token
    channel_watch: Option<Watch>,
    consumer: ConsumerState,
    broker_up: bool,
    ports: PortPool,
    streams: StreamTable,
    retry_scheduled: bool,
    tx: mpsc::UnboundedSender<MediaCommand>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MediaCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                MediaCommand::AddStream { media_id, child } => self.add_stream(media_id, child),
                MediaCommand::NextPort { reply } => {
                    let _ = reply.send(self.ports.next_port());
                }
                MediaCommand::LookupStream { media_id, reply } => {
                    let _ = reply.send(self.streams.get(&media_id));
                }
                MediaCommand::Bootstrap => self.bootstrap().await,
                MediaCommand::Incoming(delivery) => self.incoming(delivery),
                MediaCommand::Dispatched => self.ports.fill(),
                MediaCommand::StreamDown { media_id, child_id } => {
                    if self.streams.remove_if(&media_id, child_id) {
                        tracing::info!(media = %media_id, child = child_id, "stream child exited");
                    } else {
                        tracing::debug!(media = %media_id, child = child_id, "spurious stream-down ignored");
                    }
                }
                MediaCommand::ChannelDown => self.channel_down(),
                MediaCommand::HostDown(host) => {
                    tracing::warn!(host = %host, "broker host down, consumer lost");
                    self.broker_up = false;
                    self.channel = None;
                    self.channel_watch = None;
                    self.consumer = ConsumerState::Failed {
                        last_queue: self.consumer.queue_name(),
                    };
                    self.schedule_retry();
                }
            }
        }
    }

    fn add_stream(&mut self, media_id: String, child: StreamChildHandle) {
        let watch = {
            let tx = self.tx.clone();
            let media_id = media_id.clone();
            let child_id = child.id();
            Watch::spawn(child.done_token(), move || {
                let _ = tx.send(MediaCommand::StreamDown { media_id, child_id });
            })
        };
        tracing::info!(media = %media_id, child = child.id(), "stream registered");
        self.streams.insert(media_id, child, watch);
    }

    /// The coordinator's own channel died while the host may still be up;
    /// the session manager repairs its side transparently, so drive the
    /// consumer into the failure marker and rebootstrap on our own
    fn channel_down(&mut self) {
        if let Some(channel) = &self.channel {
            if !channel.closed().is_cancelled() {
                tracing::debug!("stale channel-down ignored");
                return;
            }
        }
        tracing::warn!("dispatcher channel died, consumer lost");
        self.channel = None;
        self.channel_watch = None;
        self.consumer = ConsumerState::Failed {
            last_queue: self.consumer.queue_name(),
        };
        self.schedule_retry();
    }

    /// Channel for this coordinator, reopened through the session manager
    /// whenever the previous one died
    async fn ensure_channel(&mut self) -> Result<Arc<dyn BrokerChannel>> {
        if let Some(channel) = &self.channel {
            if !channel.closed().is_cancelled() {
                return Ok(channel.clone());
            }
        }
        let opened = self
            .session
            .open_channel(&self.client, &self.config.host)
            .await?;
        opened.channel.declare_exchange(CALLMGR, ExchangeKind::Topic).await?;
        opened
            .channel
            .declare_exchange(TARGETED, ExchangeKind::Direct)
            .await?;
        self.channel_watch = Some({
            let tx = self.tx.clone();
            Watch::spawn(opened.channel.closed(), move || {
                let _ = tx.send(MediaCommand::ChannelDown);
            })
        });
        self.channel = Some(opened.channel.clone());
        Ok(opened.channel)
    }

    async fn bootstrap(&mut self) {
        self.retry_scheduled = false;
        match self.try_bootstrap().await {
            Ok(queue) => {
                tracing::info!(queue = %queue, "media consumer started");
                self.consumer = ConsumerState::Active(queue);
                self.broker_up = true;
                self.ports.fill();
            }
            Err(err) => {
                tracing::warn!(error = %err, "media consumer bootstrap failed, will retry");
                self.consumer = ConsumerState::Failed {
                    last_queue: self.consumer.queue_name(),
                };
                self.schedule_retry();
            }
        }
    }

    async fn try_bootstrap(&mut self) -> Result<String> {
        let channel = self.ensure_channel().await?;

        // the previous queue may survive an ungraceful consumer loss
        if let Some(stale) = self.consumer.queue_name() {
            if let Err(err) = channel.delete_queue(&stale).await {
                tracing::debug!(queue = %stale, error = %err, "stale queue delete failed");
            }
        }

        let queue = channel.declare_queue("", QueueOptions::reply_queue()).await?;
        channel.bind_queue(&queue, CALLEVT, MEDIA_REQ_KEY).await?;
        channel.bind_queue(&queue, TARGETED, &queue).await?;
        let mut deliveries = channel.consume(&queue).await?;

        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                if tx.send(MediaCommand::Incoming(delivery)).is_err() {
                    break;
                }
            }
        });
        Ok(queue)
    }

    fn schedule_retry(&mut self) {
        if self.retry_scheduled {
            return;
        }
        self.retry_scheduled = true;
        let tx = self.tx.clone();
        let delay = self.config.retry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(MediaCommand::Bootstrap);
        });
    }

    /// Take a port and hand the request to a fresh handler task
    ///
    /// The handler is supervised: a panic inside it is converted into an
    /// `Error-Code=other` reply to the requester instead of vanishing.
    fn incoming(&mut self, delivery: Delivery) {
        if !self.broker_up {
            tracing::debug!("media request drained after broker loss, dropped");
            return;
        }
        let Some(channel) = self.channel.clone() else {
            tracing::warn!("media request arrived with no live channel, dropped");
            return;
        };
        let port = self.ports.next_port();
        let ctx = HandlerContext {
            channel,
            store: self.store.clone(),
            supervisor: self.supervisor.clone(),
            tx: self.tx.clone(),
            default_db: self.config.default_db.clone(),
            origin: self.consumer.queue_name().unwrap_or_default(),
        };

        let watcher_ctx = ctx.clone();
        let payload = delivery.payload.clone();
        let handler = tokio::spawn(async move {
            handle_request(ctx, delivery, port).await;
        });
        tokio::spawn(async move {
            if handler.await.is_ok() {
                return;
            }
            tracing::error!("media request handler panicked");
            let Ok(envelope) = Envelope::from_slice(&payload) else {
                return;
            };
            let requester = envelope.str_field(SERVER_ID).map(str::to_string);
            let media_name = envelope.str_field(MEDIA_NAME).unwrap_or("").to_string();
            send_error_reply(
                &watcher_ctx,
                requester,
                media_name,
                "other",
                "media request handler crashed".to_string(),
            )
            .await;
            let _ = watcher_ctx.tx.send(MediaCommand::Dispatched);
        });
    }
}

#[derive(Clone)]
struct HandlerContext {
    channel: Arc<dyn BrokerChannel>,
    store: Arc<dyn MediaStore>,
    supervisor: Arc<dyn StreamSupervisor>,
    tx: mpsc::UnboundedSender<MediaCommand>,
    default_db: String,
    origin: String,
}

async fn handle_request(ctx: HandlerContext, delivery: Delivery, port: Result<PortLease>) {
    let envelope = match Envelope::from_slice(&delivery.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = %err, "undecodable media request dropped");
            return;
        }
    };
    let requester = envelope.str_field(SERVER_ID).map(str::to_string);
    let media_name = envelope.str_field(MEDIA_NAME).unwrap_or("").to_string();

    match process(&ctx, &envelope, port).await {
        Ok(Some(url)) => {
            let mut reply = Envelope::new();
            reply.set(MEDIA_NAME, media_name);
            reply.set(STREAM_URL, url);
            reply.set(SERVER_ID, ctx.origin.clone());
            send_reply(&ctx, requester, reply, RequestKind::MediaResp).await;
        }
        Ok(None) => {}
        Err(err) => {
            tracing::info!(media = %media_name, error = %err, "media request failed");
            send_error_reply(&ctx, requester, media_name, err.media_error_code(), err.to_string())
                .await;
        }
    }
    let _ = ctx.tx.send(MediaCommand::Dispatched);
}

async fn send_error_reply(
    ctx: &HandlerContext,
    requester: Option<String>,
    media_name: String,
    code: &str,
    message: String,
) {
    let mut reply = Envelope::new();
    reply.set(MEDIA_NAME, media_name);
    reply.set(ERROR_CODE, code);
    reply.set(ERROR_MSG, message);
    reply.set(SERVER_ID, ctx.origin.clone());
    send_reply(ctx, requester, reply, RequestKind::MediaError).await;
}

async fn send_reply(
    ctx: &HandlerContext,
    requester: Option<String>,
    reply: Envelope,
    kind: RequestKind,
) {
    let Some(requester) = requester else {
        tracing::warn!("media request carried no Server-ID, reply dropped");
        return;
    };
    let shaped = match reply.shape(kind) {
        Ok(shaped) => shaped,
        Err(err) => {
            tracing::warn!(error = %err, "media reply failed shaping");
            return;
        }
    };
    if let Err(err) = ctx
        .channel
        .publish(&PublishTarget::targeted(requester), shaped.to_bytes())
        .await
    {
        tracing::warn!(error = %err, "media reply publish failed");
    }
}

/// Resolve and dispatch one request; `Some(url)` means a child was started
async fn process(
    ctx: &HandlerContext,
    envelope: &Envelope,
    port: Result<PortLease>,
) -> Result<Option<String>> {
    envelope.validate(RequestKind::MediaReq)?;
    // both fields are present after validation
    let media_name = envelope.str_field(MEDIA_NAME).unwrap_or("");
    let reply_to = envelope.str_field(SERVER_ID).unwrap_or("");

    let media = resolve(ctx.store.as_ref(), &ctx.default_db, media_name).await?;

    if envelope.str_field(STREAM_TYPE).unwrap_or("new") == "extant" {
        if let Some(child) = lookup_stream(&ctx.tx, media_name).await {
            tracing::debug!(media = %media_name, child = child.id(), "joining existing stream");
            child.add_listener(reply_to);
            return Ok(None);
        }
        // no live stream to join: start a continuous one and register it
        let started = ctx
            .supervisor
            .start(media, reply_to, StreamMode::Continuous, port?)
            .await?;
        let _ = ctx.tx.send(MediaCommand::AddStream {
            media_id: media_name.to_string(),
            child: started.child.clone(),
        });
        return Ok(Some(started.url));
    }

    let started = ctx
        .supervisor
        .start(media, reply_to, StreamMode::Single, port?)
        .await?;
    Ok(Some(started.url))
}

async fn lookup_stream(
    tx: &mpsc::UnboundedSender<MediaCommand>,
    media_id: &str,
) -> Option<StreamChildHandle> {
    let (reply, rx) = oneshot::channel();
    tx.send(MediaCommand::LookupStream {
        media_id: media_id.to_string(),
        reply,
    })
    .ok()?;
    rx.await.ok().flatten()
}
