//! In-process broker
//!
//! A complete in-memory implementation of the broker traits with
//! direct/topic/fanout routing, server-named queues, exclusive-queue
//! cleanup on channel close, and per-host kill switches for driving the
//! failure paths in tests. Also usable as an embedded broker when a
//! deployment runs everything in one process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    Broker, BrokerChannel, BrokerConnection, Delivery, ExchangeKind, PublishTarget, QueueOptions,
    ReturnHandler,
};
use crate::error::{Error, Result};

/// Match a topic binding pattern against a routing key
///
/// Dot-separated words; `*` matches exactly one word, `#` matches any
/// number of words including none.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn rec(p: &[&str], k: &[&str]) -> bool {
        match p.split_first() {
            None => k.is_empty(),
            Some((&"#", rest)) => {
                if rec(rest, k) {
                    return true;
                }
                match k.split_first() {
                    Some((_, krest)) => rec(p, krest),
                    None => false,
                }
            }
            Some((&"*", rest)) => match k.split_first() {
                Some((_, krest)) => rec(rest, krest),
                None => false,
            },
            Some((lit, rest)) => match k.split_first() {
                Some((kw, krest)) if kw == lit => rec(rest, krest),
                _ => false,
            },
        }
    }
    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    rec(&p, &k)
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    auto_delete: bool,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

/// One virtual broker host: exchanges, queues, bindings
struct MemoryHost {
    name: String,
    alive: CancellationToken,
    exchanges: Mutex<HashMap<String, ExchangeKind>>,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    bindings: Mutex<Vec<Binding>>,
    next_queue: AtomicU64,
    next_ticket: AtomicU16,
}

impl MemoryHost {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            alive: CancellationToken::new(),
            exchanges: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            bindings: Mutex::new(Vec::new()),
            next_queue: AtomicU64::new(1),
            next_ticket: AtomicU16::new(0),
        })
    }
}

/// In-memory broker over any number of virtual hosts
pub struct MemoryBroker {
    hosts: Mutex<HashMap<String, Arc<MemoryHost>>>,
    refused: Mutex<HashSet<String>>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
        })
    }

    /// Refuse subsequent connection attempts to `host`
    pub fn refuse(&self, host: &str) {
        self.refused.lock().unwrap().insert(host.to_string());
    }

    /// Accept connection attempts to `host` again
    pub fn accept(&self, host: &str) {
        self.refused.lock().unwrap().remove(host);
    }

    /// Kill `host`: every connection and channel on it observes death,
    /// and its queues are gone. A later connect builds a fresh host.
    pub fn kill_host(&self, host: &str) {
        let entry = self.hosts.lock().unwrap().remove(host);
        if let Some(state) = entry {
            state.alive.cancel();
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, host: &str) -> Result<Arc<dyn BrokerConnection>> {
        if self.refused.lock().unwrap().contains(host) {
            return Err(Error::NoBroker);
        }
        let state = self
            .hosts
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_insert_with(|| MemoryHost::new(host))
            .clone();
        Ok(Arc::new(MemoryConnection {
            closed: state.alive.child_token(),
            host: state,
        }))
    }
}

struct MemoryConnection {
    host: Arc<MemoryHost>,
    closed: CancellationToken,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.closed.is_cancelled() {
            return Err(Error::Broker(format!(
                "connection to {} is closed",
                self.host.name
            )));
        }
        Ok(Arc::new(MemoryChannel {
            host: self.host.clone(),
            closed: self.closed.child_token(),
            returns: Mutex::new(None),
            owned: Mutex::new(Vec::new()),
        }))
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

struct MemoryChannel {
    host: Arc<MemoryHost>,
    closed: CancellationToken,
    returns: Mutex<Option<ReturnHandler>>,
    /// Queues consumed on this channel, released at close
    owned: Mutex<Vec<String>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Broker("channel is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn access_request(&self) -> Result<u16> {
        self.ensure_open()?;
        Ok(self.host.next_ticket.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_open()?;
        let mut exchanges = self.host.exchanges.lock().unwrap();
        match exchanges.get(name) {
            Some(existing) if *existing != kind => Err(Error::Broker(format!(
                "exchange {name} already declared with a different type"
            ))),
            _ => {
                exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<String> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            let n = self.host.next_queue.fetch_add(1, Ordering::Relaxed);
            format!("amq.gen-{n:08}")
        } else {
            name.to_string()
        };
        let mut queues = self.host.queues.lock().unwrap();
        if !queues.contains_key(&name) {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(
                name.clone(),
                Arc::new(MemoryQueue {
                    tx,
                    rx: Mutex::new(Some(rx)),
                    auto_delete: opts.auto_delete || opts.exclusive,
                }),
            );
        }
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.host.exchanges.lock().unwrap().contains_key(exchange) {
            return Err(Error::Broker(format!("no exchange {exchange}")));
        }
        if !self.host.queues.lock().unwrap().contains_key(queue) {
            return Err(Error::Broker(format!("no queue {queue}")));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            key: routing_key.to_string(),
        };
        let mut bindings = self.host.bindings.lock().unwrap();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let removed = self.host.queues.lock().unwrap().remove(queue);
        if removed.is_none() {
            return Err(Error::Broker(format!("no queue {queue}")));
        }
        self.host.bindings.lock().unwrap().retain(|b| b.queue != queue);
        Ok(())
    }

    async fn publish(&self, target: &PublishTarget, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let kind = match self.host.exchanges.lock().unwrap().get(target.exchange) {
            Some(kind) => *kind,
            None => return Err(Error::Broker(format!("no exchange {}", target.exchange))),
        };
        let matched: Vec<Arc<MemoryQueue>> = {
            let bindings = self.host.bindings.lock().unwrap();
            let queues = self.host.queues.lock().unwrap();
            bindings
                .iter()
                .filter(|b| b.exchange == target.exchange)
                .filter(|b| match kind {
                    ExchangeKind::Direct => b.key == target.routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(&b.key, &target.routing_key),
                })
                .filter_map(|b| queues.get(&b.queue).cloned())
                .collect()
        };
        let payload = Bytes::from(payload);
        let mut delivered = 0usize;
        for queue in matched {
            let delivery = Delivery {
                routing_key: target.routing_key.clone(),
                payload: payload.clone(),
            };
            if queue.tx.send(delivery).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            if let Some(handler) = self.returns.lock().unwrap().as_ref() {
                handler(payload);
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        self.ensure_open()?;
        let state = self
            .host
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::Broker(format!("no queue {queue}")))?;
        let rx = state
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Broker(format!("queue {queue} already has a consumer")))?;
        self.owned.lock().unwrap().push(queue.to_string());
        Ok(rx)
    }

    fn set_return_handler(&self, handler: ReturnHandler) {
        *self.returns.lock().unwrap() = Some(handler);
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        let owned: Vec<String> = self.owned.lock().unwrap().drain(..).collect();
        let mut queues = self.host.queues.lock().unwrap();
        let mut bindings = self.host.bindings.lock().unwrap();
        for name in owned {
            let auto_delete = queues.get(&name).map(|q| q.auto_delete).unwrap_or(false);
            if auto_delete {
                queues.remove(&name);
                bindings.retain(|b| b.queue != name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::exchanges;

    async fn channel(broker: &Arc<MemoryBroker>, host: &str) -> Arc<dyn BrokerChannel> {
        let conn = broker.connect(host).await.unwrap();
        conn.open_channel().await.unwrap()
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("auth_req", "auth_req"));
        assert!(topic_matches("*", "auth_req"));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("call.*", "call.event"));
        assert!(topic_matches("call.#", "call.event.cdr"));
        assert!(!topic_matches("call.*", "call.event.cdr"));
        assert!(!topic_matches("auth_req", "route_req"));
    }

    #[tokio::test]
    async fn test_direct_routing() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker, "h1").await;
        ch.declare_exchange(exchanges::TARGETED, ExchangeKind::Direct)
            .await
            .unwrap();
        let q = ch.declare_queue("", QueueOptions::reply_queue()).await.unwrap();
        ch.bind_queue(&q, exchanges::TARGETED, &q).await.unwrap();
        let mut rx = ch.consume(&q).await.unwrap();

        ch.publish(&PublishTarget::targeted(q.clone()), b"{}".to_vec())
            .await
            .unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(&delivery.payload[..], b"{}");
        assert_eq!(delivery.routing_key, q);
    }

    #[tokio::test]
    async fn test_unroutable_message_is_returned() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker, "h1").await;
        ch.declare_exchange(exchanges::TARGETED, ExchangeKind::Direct)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        ch.set_return_handler(Box::new(move |payload| {
            let _ = tx.send(payload);
        }));
        ch.publish(&PublishTarget::targeted("nobody"), b"lost".to_vec())
            .await
            .unwrap();

        let returned = rx.recv().await.unwrap();
        assert_eq!(&returned[..], b"lost");
    }

    #[tokio::test]
    async fn test_refused_host() {
        let broker = MemoryBroker::new();
        broker.refuse("down-host");
        assert!(matches!(
            broker.connect("down-host").await.err(),
            Some(Error::NoBroker)
        ));

        broker.accept("down-host");
        assert!(broker.connect("down-host").await.is_ok());
    }

    #[tokio::test]
    async fn test_kill_host_fires_death_tokens() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("h1").await.unwrap();
        let ch = conn.open_channel().await.unwrap();

        broker.kill_host("h1");
        conn.closed().cancelled().await;
        ch.closed().cancelled().await;
        assert!(ch.access_request().await.is_err());
    }

    #[tokio::test]
    async fn test_close_releases_exclusive_queues() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("h1").await.unwrap();
        let ch = conn.open_channel().await.unwrap();
        ch.declare_exchange(exchanges::TARGETED, ExchangeKind::Direct)
            .await
            .unwrap();
        let q = ch.declare_queue("", QueueOptions::reply_queue()).await.unwrap();
        let _rx = ch.consume(&q).await.unwrap();
        ch.close().await.unwrap();

        // a fresh channel no longer sees the queue
        let ch2 = conn.open_channel().await.unwrap();
        assert!(ch2.consume(&q).await.is_err());
    }

    #[tokio::test]
    async fn test_tickets_increment() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker, "h1").await;
        let t1 = ch.access_request().await.unwrap();
        let t2 = ch.access_request().await.unwrap();
        assert!(t2 > t1);
    }
}
