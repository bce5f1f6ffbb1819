//! Pool workers
//!
//! A worker is a task owning one exclusive reply queue. It waits for a job,
//! stamps its reply queue into the payload as `Server-ID`, shapes and
//! publishes it, then blocks on exactly one of: the reply arriving on its
//! queue, or the caller going away. Either way it reports itself free and
//! waits for the next job. Replies that land while the worker is free are
//! stale by definition and get logged and dropped.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::coordinator::PoolCommand;
use super::request::CallKind;
use crate::broker::exchanges::TARGETED;
use crate::broker::{BrokerChannel, Delivery, QueueOptions};
use crate::client::ClientHandle;
use crate::envelope::{Envelope, SERVER_ID};
use crate::error::{Error, Result};
use crate::session::SessionManagerHandle;

/// One queued request handed to a worker
pub(super) struct Job {
    pub payload: Envelope,
    pub kind: CallKind,
    pub reply: oneshot::Sender<Result<Value>>,
    /// Fires when the caller abandons the call
    pub caller: CancellationToken,
}

pub(super) enum WorkerMsg {
    Job(Job),
    Shutdown,
}

/// Pool-side handle to a worker task
pub(super) struct WorkerHandle {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<WorkerMsg>,
}

/// Spawn a worker and a monitor reporting its exit to the pool
pub(super) fn spawn_worker(
    id: u64,
    session: SessionManagerHandle,
    host: String,
    pool_tx: mpsc::UnboundedSender<PoolCommand>,
) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_worker(id, session, host, rx, pool_tx.clone()));
    tokio::spawn(async move {
        let _ = task.await;
        let _ = pool_tx.send(PoolCommand::WorkerExited(id));
    });
    WorkerHandle { id, tx }
}

async fn run_worker(
    id: u64,
    session: SessionManagerHandle,
    host: String,
    mut jobs: mpsc::UnboundedReceiver<WorkerMsg>,
    pool_tx: mpsc::UnboundedSender<PoolCommand>,
) {
    // the worker is its own client process; dropping the guard on exit
    // lets the session manager release the channel
    let (client, _guard, _notices) = ClientHandle::new(format!("amqp-worker-{id}"));

    let setup = async {
        let opened = session.open_channel(&client, &host).await?;
        let queue = opened
            .channel
            .declare_queue("", QueueOptions::reply_queue())
            .await?;
        opened.channel.bind_queue(&queue, TARGETED, &queue).await?;
        let deliveries = opened.channel.consume(&queue).await?;
        Ok::<_, Error>((opened.channel, queue, deliveries))
    };
    let (channel, reply_queue, mut deliveries) = match setup.await {
        Ok(ready) => ready,
        Err(err) => {
            tracing::warn!(worker = id, error = %err, "worker setup failed");
            let cause = err.to_string();
            while let Ok(WorkerMsg::Job(job)) = jobs.try_recv() {
                let _ = job.reply.send(Err(Error::ChannelOpenFailed(cause.clone())));
            }
            // pace the replacement cycle while the broker is unreachable
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            return;
        }
    };
    tracing::debug!(worker = id, queue = %reply_queue, "worker ready");

    let closed = channel.closed();
    loop {
        tokio::select! {
            msg = jobs.recv() => match msg {
                Some(WorkerMsg::Job(job)) => {
                    if !serve(id, channel.as_ref(), &reply_queue, &mut deliveries, job).await {
                        break;
                    }
                    let _ = pool_tx.send(PoolCommand::WorkerFree(id));
                }
                Some(WorkerMsg::Shutdown) | None => {
                    tracing::debug!(worker = id, "worker shutting down");
                    break;
                }
            },
            stale = deliveries.recv() => match stale {
                Some(_) => tracing::debug!(worker = id, "stale reply while free, dropped"),
                None => break,
            },
            _ = closed.cancelled() => {
                tracing::warn!(worker = id, "channel died, worker exiting");
                break;
            }
        }
    }
}

/// Serve one job; returns false when the channel is unusable
async fn serve(
    id: u64,
    channel: &dyn BrokerChannel,
    reply_queue: &str,
    deliveries: &mut mpsc::UnboundedReceiver<Delivery>,
    job: Job,
) -> bool {
    let Job {
        mut payload,
        kind,
        reply,
        caller,
    } = job;

    // anything still sitting on the reply queue predates this request
    while let Ok(stale) = deliveries.try_recv() {
        tracing::debug!(worker = id, key = %stale.routing_key, "stale reply dropped");
    }

    payload.remove(SERVER_ID);
    payload.set(SERVER_ID, reply_queue);
    let shaped = match payload.shape(kind.request_kind()) {
        Ok(shaped) => shaped,
        Err(err) => {
            let _ = reply.send(Err(err));
            return true;
        }
    };

    if let Err(err) = channel.publish(&kind.publish_target(), shaped.to_bytes()).await {
        tracing::warn!(worker = id, error = %err, "publish failed");
        let _ = reply.send(Err(err));
        return true;
    }

    tokio::select! {
        delivery = deliveries.recv() => match delivery {
            Some(delivery) => {
                let decoded = serde_json::from_slice::<Value>(&delivery.payload)
                    .map_err(Error::from);
                let _ = reply.send(decoded);
                true
            }
            None => {
                let _ = reply.send(Err(Error::NoBroker));
                false
            }
        },
        _ = caller.cancelled() => {
            tracing::debug!(worker = id, "caller went away, abandoning reply");
            true
        }
    }
}
