//! Pool coordinator
//!
//! A single task owns the worker table and the Free queue. Requests lease
//! the head of Free or spawn a fresh worker when none is idle; freed
//! workers re-join at the tail. A periodic trim tick shrinks the pool back
//! toward its baseline using only idle workers, never one that is serving.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::config::PoolConfig;
use super::request::CallKind;
use super::worker::{spawn_worker, Job, WorkerHandle, WorkerMsg};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::session::SessionManagerHandle;

pub(super) enum PoolCommand {
    Request(Job),
    WorkerFree(u64),
    WorkerExited(u64),
    TrimTick,
    Stats(oneshot::Sender<PoolStats>),
    Shutdown,
}

/// A snapshot of the pool's size counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total live workers, free plus busy
    pub workers: usize,
    /// Workers currently idle
    pub free: usize,
    /// Requests served since the last trim tick
    pub served_since_trim: u64,
}

/// Handle to the worker pool, cheap to clone
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<PoolCommand>,
    default_timeout: Duration,
}

impl PoolHandle {
    /// Authentication request for an inbound endpoint
    pub async fn auth_req(&self, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        self.call(CallKind::AuthReq, payload, timeout).await
    }

    /// Routing request for an inbound call
    pub async fn route_req(&self, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        self.call(CallKind::RouteReq, payload, timeout).await
    }

    /// Registration lookup
    pub async fn reg_query(&self, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        self.call(CallKind::RegQuery, payload, timeout).await
    }

    /// Media fetch request
    pub async fn media_req(&self, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        self.call(CallKind::MediaReq, payload, timeout).await
    }

    /// Run one request/reply transaction of the given kind
    ///
    /// Returns the decoded JSON reply, [`Error::EnvelopeInvalid`] when the
    /// payload fails the kind's schema, or [`Error::Timeout`] when no reply
    /// arrives inside the deadline. On timeout the serving worker observes
    /// the abandonment and returns to the pool on its own.
    pub async fn call(
        &self,
        kind: CallKind,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let payload = Envelope::from_value(payload)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let caller = CancellationToken::new();
        let guard = caller.clone().drop_guard();

        self.tx
            .send(PoolCommand::Request(Job {
                payload,
                kind,
                reply: reply_tx,
                caller,
            }))
            .map_err(|_| Error::Closed)?;

        let deadline = timeout.unwrap_or(self.default_timeout);
        let result = match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout),
        };
        // dropping the guard cancels the caller token; doing it here keeps
        // the caller visibly alive for exactly the life of the call
        drop(guard);
        result
    }

    /// Current size counters
    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Stats(reply))
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Shut the pool down; idle workers exit, busy ones finish first
    pub fn shutdown(&self) {
        let _ = self.tx.send(PoolCommand::Shutdown);
    }
}

/// The elastic request/reply worker pool
pub struct Pool;

impl Pool {
    /// Spawn the pool coordinator and its baseline workers
    pub fn spawn(config: PoolConfig, session: SessionManagerHandle) -> PoolHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let ticker = tx.clone();
        let interval = config.trim_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // the first tick fires immediately
            loop {
                timer.tick().await;
                if ticker.send(PoolCommand::TrimTick).is_err() {
                    break;
                }
            }
        });

        let default_timeout = config.default_timeout;
        let coordinator = Coordinator {
            config,
            session,
            workers: HashMap::new(),
            free: VecDeque::new(),
            served: 0,
            next_id: 1,
            tx: tx.clone(),
        };
        tokio::spawn(coordinator.run(rx));

        PoolHandle {
            tx,
            default_timeout,
        }
    }
}

struct Coordinator {
    config: PoolConfig,
    session: SessionManagerHandle,
    workers: HashMap<u64, WorkerHandle>,
    free: VecDeque<u64>,
    served: u64,
    next_id: u64,
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolCommand>) {
        // startup top-up to the baseline
        while self.free.len() < self.config.baseline {
            let id = self.spawn_one();
            self.free.push_back(id);
        }
        tracing::info!(baseline = self.config.baseline, "worker pool started");

        while let Some(command) = rx.recv().await {
            match command {
                PoolCommand::Request(job) => self.dispatch(job),
                PoolCommand::WorkerFree(id) => {
                    if self.workers.contains_key(&id) {
                        self.free.push_back(id);
                    }
                }
                PoolCommand::WorkerExited(id) => self.worker_exited(id),
                PoolCommand::TrimTick => self.reduce_labor_force(),
                PoolCommand::Stats(reply) => {
                    let _ = reply.send(PoolStats {
                        workers: self.workers.len(),
                        free: self.free.len(),
                        served_since_trim: self.served,
                    });
                }
                PoolCommand::Shutdown => {
                    tracing::info!(workers = self.workers.len(), "worker pool shutting down");
                    for (_, worker) in self.workers.drain() {
                        let _ = worker.tx.send(WorkerMsg::Shutdown);
                    }
                    break;
                }
            }
        }
    }

    fn spawn_one(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let worker = spawn_worker(
            id,
            self.session.clone(),
            self.config.host.clone(),
            self.tx.clone(),
        );
        self.workers.insert(id, worker);
        id
    }

    /// Lease the head of Free, or scale up by one worker
    fn dispatch(&mut self, job: Job) {
        self.served += 1;
        let mut job = job;
        loop {
            match self.free.pop_front() {
                Some(id) => match self.workers.get(&id) {
                    Some(worker) => match worker.tx.send(WorkerMsg::Job(job)) {
                        Ok(()) => return,
                        Err(mpsc::error::SendError(WorkerMsg::Job(rejected))) => {
                            // raced a dying worker; try the next one
                            job = rejected;
                        }
                        Err(_) => return,
                    },
                    None => continue,
                },
                None => {
                    let id = self.spawn_one();
                    tracing::debug!(workers = self.workers.len(), "scaled up");
                    if let Some(worker) = self.workers.get(&id) {
                        let _ = worker.tx.send(WorkerMsg::Job(job));
                    }
                    return;
                }
            }
        }
    }

    /// A worker died; replace it if the pool fell below baseline
    fn worker_exited(&mut self, id: u64) {
        if self.workers.remove(&id).is_none() {
            // a trimmed worker finishing its shutdown
            return;
        }
        self.free.retain(|free_id| *free_id != id);
        tracing::warn!(worker = id, workers = self.workers.len(), "worker exited");
        if self.workers.len() < self.config.baseline {
            let replacement = self.spawn_one();
            self.free.push_back(replacement);
            tracing::debug!(worker = replacement, "spawned replacement worker");
        }
    }

    /// Periodic scale-down toward the baseline
    fn reduce_labor_force(&mut self) {
        let served = self.served;
        let count = self.workers.len();
        let baseline = self.config.baseline;

        if served < baseline as u64 && count > baseline {
            // quiescent: return to baseline
            while self.free.len() > baseline {
                self.shutdown_one();
            }
        } else if served < count as u64 && count > baseline {
            // partially busy: shed the excess over what was actually used
            let mut excess = count as u64 - served;
            while excess > 0 && self.free.len() > baseline {
                self.shutdown_one();
                excess -= 1;
            }
        }
        self.served = 0;
    }

    fn shutdown_one(&mut self) {
        if let Some(id) = self.free.pop_front() {
            if let Some(worker) = self.workers.remove(&id) {
                let _ = worker.tx.send(WorkerMsg::Shutdown);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::exchanges::{CALLMGR, TARGETED};
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{PublishTarget, QueueOptions};
    use crate::client::ClientHandle;
    use crate::envelope::SERVER_ID;
    use crate::session::SessionManager;
    use serde_json::json;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    /// Consume `key` on the call-manager exchange and answer each request
    /// with `reply` after `delay`, keeping the client alive for the test.
    async fn spawn_responder(
        session: &SessionManagerHandle,
        key: &'static str,
        reply: Value,
        delay: Duration,
    ) -> crate::client::ClientGuard {
        let (client, guard, _notices) = ClientHandle::new(format!("responder-{key}"));
        let opened = session.open_channel(&client, "h1").await.unwrap();
        let queue = opened
            .channel
            .declare_queue("", QueueOptions::reply_queue())
            .await
            .unwrap();
        opened.channel.bind_queue(&queue, CALLMGR, key).await.unwrap();
        let mut deliveries = opened.channel.consume(&queue).await.unwrap();

        let channel = opened.channel.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let request = Envelope::from_slice(&delivery.payload).unwrap();
                let server_id = request.str_field(SERVER_ID).unwrap().to_string();
                let body = serde_json::to_vec(&reply).unwrap();
                let channel = channel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = channel
                        .publish(&PublishTarget::targeted(server_id), body)
                        .await;
                });
            }
        });
        guard
    }

    fn pool_config(baseline: usize) -> PoolConfig {
        PoolConfig::with_host("h1")
            .baseline(baseline)
            .default_timeout(Duration::from_secs(2))
            .trim_interval(Duration::from_millis(150))
    }

    #[tokio::test]
    async fn test_auth_round_trip() {
        let broker = MemoryBroker::new();
        let session = SessionManager::spawn(broker);
        let _responder = spawn_responder(
            &session,
            "auth_req",
            json!({"Result": "granted"}),
            Duration::ZERO,
        )
        .await;

        let pool = Pool::spawn(pool_config(2), session);
        let reply = pool
            .auth_req(json!({"Msg-ID": "m1", "To": "u@d"}), None)
            .await
            .unwrap();

        assert_eq!(reply["Result"], "granted");
    }

    #[tokio::test]
    async fn test_validation_failure_is_synchronous_and_silent() {
        let broker = MemoryBroker::new();
        let session = SessionManager::spawn(broker);
        let pool = Pool::spawn(pool_config(2), session);

        let err = pool.route_req(json!({}), None).await.unwrap_err();
        assert!(matches!(err, Error::EnvelopeInvalid(_)));
    }

    #[tokio::test]
    async fn test_elastic_scale_up_and_trim_back() {
        let broker = MemoryBroker::new();
        let session = SessionManager::spawn(broker);
        let _responder = spawn_responder(
            &session,
            "reg_query",
            json!({"Fields": []}),
            Duration::from_millis(300),
        )
        .await;

        let pool = Pool::spawn(pool_config(3), session);
        settle().await;

        let calls: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.reg_query(
                        json!({"Msg-ID": format!("m{i}"), "Username": "u", "Realm": "r"}),
                        Some(Duration::from_secs(2)),
                    )
                    .await
                })
            })
            .collect();

        // while all eight are in flight the pool must have grown
        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers, 8);

        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }

        // two quiescent trim ticks bring it back to baseline
        tokio::time::sleep(Duration::from_millis(400)).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers, 3);
        assert_eq!(stats.free, 3);
        assert_eq!(stats.served_since_trim, 0);
    }

    #[tokio::test]
    async fn test_caller_timeout_does_not_leak_workers() {
        let broker = MemoryBroker::new();
        let session = SessionManager::spawn(broker);
        // responder that replies long after the caller gave up
        let _responder = spawn_responder(
            &session,
            "auth_req",
            json!({"Result": "late"}),
            Duration::from_millis(300),
        )
        .await;

        let pool = Pool::spawn(pool_config(2), session);
        settle().await;

        let err = pool
            .auth_req(
                json!({"Msg-ID": "m1", "To": "u@d"}),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // the worker observed the abandonment and is free again
        settle().await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.free, 2);

        // the stale reply arriving later does not poison the next call
        tokio::time::sleep(Duration::from_millis(350)).await;
        let reply = pool
            .auth_req(json!({"Msg-ID": "m2", "To": "u@d"}), None)
            .await
            .unwrap();
        assert_eq!(reply["Result"], "late");
    }

    #[tokio::test]
    async fn test_dead_workers_are_replaced_up_to_baseline() {
        let broker = MemoryBroker::new();
        let session = SessionManager::spawn(broker.clone());
        let pool = Pool::spawn(pool_config(3), session);
        settle().await;
        assert_eq!(pool.stats().await.unwrap().workers, 3);

        // every worker channel dies with the host
        broker.kill_host("h1");
        tokio::time::sleep(Duration::from_millis(300)).await;

        // replacements were spawned against the rebuilt host
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers, 3);
    }

    #[tokio::test]
    async fn test_trim_with_served_equal_to_count_keeps_workers() {
        let broker = MemoryBroker::new();
        let session = SessionManager::spawn(broker);
        let _responder = spawn_responder(
            &session,
            "auth_req",
            json!({"Result": "granted"}),
            Duration::ZERO,
        )
        .await;

        // baseline 1: a steady one-call-per-tick load must not shrink below it
        let pool = Pool::spawn(pool_config(1), session);
        for i in 0..3 {
            pool.auth_req(json!({"Msg-ID": format!("m{i}"), "To": "u@d"}), None)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(160)).await;
        }
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_pool() {
        let broker = MemoryBroker::new();
        let session = SessionManager::spawn(broker);
        let pool = Pool::spawn(pool_config(2), session);
        settle().await;

        pool.shutdown();
        settle().await;
        assert!(pool.stats().await.is_err());
    }
}
