//! The key-value demo on the tokio stack: same lossy link, same
//! exactly-once outcome, with the async client and dispatcher.
//!
//! Run with `--features tokio`.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use oncerpc::tokio::{AsyncHandler, TokioDispatcher, TokioMpscTransport, TokioRetryClient};
use oncerpc::{AppError, AppResult, ClientId, Packet, RetryLimit, RetryPolicy, Transport};
use rand_core::{OsRng, RngCore};

#[derive(Debug, Clone, PartialEq, Eq)]
enum KvOp {
    Get(String),
    Append(String, String),
}

struct KvStore {
    map: Mutex<HashMap<String, String>>,
}

impl AsyncHandler for KvStore {
    type Op = KvOp;
    type Ret = String;

    async fn execute(&self, _client: ClientId, op: KvOp) -> AppResult<String> {
        let mut map = self.map.lock().unwrap();
        match op {
            KvOp::Get(key) => {
                map.get(&key).cloned().ok_or_else(|| AppError::new(format!("no such key: {key}")))
            }
            KvOp::Append(key, val) => {
                let entry = map.entry(key).or_default();
                entry.push_str(&val);
                Ok(entry.clone())
            }
        }
    }
}

fn drop_packet() -> bool {
    OsRng.next_u32() >= u32::MAX / 4 * 3
}

fn lossy_policy() -> RetryPolicy {
    RetryPolicy {
        interval: Duration::from_millis(10),
        limit: RetryLimit::Attempts(NonZeroU32::new(64).unwrap()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let (to_server, mut server_rx) = TokioMpscTransport::<KvOp, String>::new();
    let dispatcher = Arc::new(TokioDispatcher::new(KvStore { map: Mutex::new(HashMap::new()) }));

    let mut reply_links = HashMap::new();
    let mut clients = Vec::new();
    for id in 1..=2u64 {
        let (to_client, mut client_rx) = TokioMpscTransport::<KvOp, String>::new();
        reply_links.insert(ClientId::new(id), to_client);
        let client = Arc::new(TokioRetryClient::with_policy(
            ClientId::new(id),
            to_server.clone(),
            lossy_policy(),
        ));
        clients.push(client.clone());
        tokio::spawn(async move {
            while let Some(packet) = client_rx.recv().await {
                if drop_packet() {
                    continue;
                }
                if let Packet::Reply(reply) = packet {
                    client.deliver(reply);
                }
            }
        });
    }

    {
        let dispatcher = dispatcher.clone();
        let reply_links = Arc::new(reply_links);
        tokio::spawn(async move {
            while let Some(packet) = server_rx.recv().await {
                if drop_packet() {
                    continue;
                }
                if let Packet::Request(request) = packet {
                    let dispatcher = dispatcher.clone();
                    let reply_links = reply_links.clone();
                    tokio::spawn(async move {
                        if let Ok(reply) = dispatcher.dispatch(request).await {
                            if let Some(link) = reply_links.get(&reply.client) {
                                link.send_reply(&reply);
                            }
                        }
                    });
                }
            }
        });
    }

    let workers: Vec<_> = clients
        .into_iter()
        .map(|client| {
            tokio::spawn(async move {
                let key = format!("k{}", client.id().as_u64());
                for _ in 0..8 {
                    client.call(KvOp::Append(key.clone(), "a".to_string())).await.unwrap();
                }
                client.call(KvOp::Get(key)).await.unwrap()
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.await.unwrap(), "aaaaaaaa");
    }
    tracing::info!("both clients converged on exactly-once appends");
}
