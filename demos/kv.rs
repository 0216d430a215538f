//! A tiny key-value service behind the delivery layer, driven by two
//! clients over a deliberately lossy in-process link. Every packet has
//! a 25% chance of being dropped in each direction; the final store
//! contents prove that each append nevertheless executed exactly once.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use oncerpc::{
    AppError, AppResult, ClientId, Dispatcher, Handler, MpscTransport, Packet, RetryClient,
    RetryLimit, RetryPolicy, Transport,
};
use rand_core::{OsRng, RngCore};

#[derive(Debug, Clone, PartialEq, Eq)]
enum KvOp {
    Get(String),
    Put(String, String),
    Append(String, String),
}

struct KvStore {
    map: Mutex<HashMap<String, String>>,
}

impl Handler for KvStore {
    type Op = KvOp;
    type Ret = String;

    fn execute(&self, _client: ClientId, op: KvOp) -> AppResult<String> {
        let mut map = self.map.lock().unwrap();
        match op {
            KvOp::Get(key) => {
                map.get(&key).cloned().ok_or_else(|| AppError::new(format!("no such key: {key}")))
            }
            KvOp::Put(key, val) => {
                map.insert(key, val);
                Ok(String::new())
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

fn main() {
    tracing_subscriber::fmt().init();

    let (to_server, server_rx) = MpscTransport::<KvOp, String>::new();
    let dispatcher = Arc::new(Dispatcher::new(KvStore { map: Mutex::new(HashMap::new()) }));

    // One reply link per client; the server routes replies by client id.
    let mut reply_links = HashMap::new();
    let mut clients = Vec::new();
    for id in 1..=2u64 {
        let (to_client, client_rx) = MpscTransport::<KvOp, String>::new();
        reply_links.insert(ClientId::new(id), to_client);
        let client = Arc::new(RetryClient::with_policy(
            ClientId::new(id),
            to_server.clone(),
            lossy_policy(),
        ));
        clients.push(client.clone());
        thread::spawn(move || {
            for packet in client_rx {
                // The lossy wire, inbound side.
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
        thread::spawn(move || {
            for packet in server_rx {
                if drop_packet() {
                    continue;
                }
                if let Packet::Request(request) = packet {
                    let dispatcher = dispatcher.clone();
                    let reply_links = reply_links.clone();
                    // One worker per inbound request; unrelated clients
                    // never wait on each other.
                    thread::spawn(move || {
                        if let Ok(reply) = dispatcher.dispatch(request) {
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
            thread::spawn(move || {
                let key = format!("k{}", client.id().as_u64());
                client.call(KvOp::Put(key.clone(), String::new())).unwrap();
                for _ in 0..8 {
                    client.call(KvOp::Append(key.clone(), "a".to_string())).unwrap();
                }
                client.call(KvOp::Get(key)).unwrap()
            })
        })
        .collect();

    for worker in workers {
        // Exactly 8 appends survived the lossy link, not more, not less.
        assert_eq!(worker.join().unwrap(), "aaaaaaaa");
    }
    tracing::info!("both clients converged on exactly-once appends");
}

#[test]
fn test() {
    main()
}
