//! Contract listeners: keep one log subscription per contract bound to the
//! pool's active connection and publish what they decode.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use chainrelay_core::{DomainEvent, EventBus, TransportError, TRANSACTIONS_TOPIC};
use chainrelay_ws::{ConnectionHandle, ConnectionPool, Listener, Topic};

use crate::abi::{event_topic, AbiData, DecodeError};

/// A contract event the relay understands.
pub struct ContractEvent {
    pub name: &'static str,
    /// Canonical signature, hashed into `topics[0]`.
    pub signature: &'static str,
    decode: fn(&AbiData) -> Result<DomainEvent, DecodeError>,
}

/// `CheckedIn(sender, token, timestamp, count, userId)`
pub static CHECKED_IN: ContractEvent = ContractEvent {
    name: "CheckedIn",
    signature: "CheckedIn(address,address,uint256,uint256,string)",
    decode: decode_checked_in,
};

/// `ItemPurchased(sender, id, name, price, userId)`
pub static ITEM_PURCHASED: ContractEvent = ContractEvent {
    name: "ItemPurchased",
    signature: "ItemPurchased(address,uint256,string,uint256,string)",
    decode: decode_item_purchased,
};

fn decode_checked_in(data: &AbiData) -> Result<DomainEvent, DecodeError> {
    Ok(DomainEvent::CheckIn { user_id: data.string(4)? })
}

fn decode_item_purchased(data: &AbiData) -> Result<DomainEvent, DecodeError> {
    Ok(DomainEvent::PurchaseItem {
        user_id: data.string(4)?,
        item_id: data.uint(1)?,
    })
}

impl ContractEvent {
    pub fn topic0(&self) -> String {
        event_topic(self.signature)
    }

    /// Decode one `logs` push. `Ok(None)` for removed (reorged) logs and for
    /// logs of some other event.
    pub fn decode_log(&self, log: &Value) -> Result<Option<DomainEvent>, DecodeError> {
        if log.get("removed").and_then(Value::as_bool) == Some(true) {
            return Ok(None);
        }
        let topic0 = log.pointer("/topics/0").and_then(Value::as_str);
        if topic0.is_some_and(|t| !t.eq_ignore_ascii_case(&self.topic0())) {
            return Ok(None);
        }
        let data = AbiData::from_hex(log.get("data").and_then(Value::as_str).unwrap_or("0x"))?;
        let event = (self.decode)(&data)?;
        if let Ok(sender) = data.address(0) {
            debug!(event = self.name, %sender, "decoded log");
        }
        Ok(Some(event))
    }
}

/// Binds one contract event to the pool and republishes it on the bus.
pub struct ContractListener {
    address: String,
    event: &'static ContractEvent,
    bus: Arc<EventBus<DomainEvent>>,
    /// Endpoint indexes already holding this subscription.
    bound: Mutex<HashSet<usize>>,
}

impl ContractListener {
    pub fn new(
        address: impl Into<String>,
        event: &'static ContractEvent,
        bus: Arc<EventBus<DomainEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            event,
            bus,
            bound: Mutex::new(HashSet::new()),
        })
    }

    /// `eth_subscribe("logs", {address, topics: [topic0]})`
    pub fn topic(&self) -> Topic {
        Topic::logs(json!({
            "address": self.address,
            "topics": [self.event.topic0()],
        }))
    }

    /// Subscribe on the pool's current connection and again on every
    /// connection a failover hands over.
    pub async fn start(self: &Arc<Self>, pool: &ConnectionPool) -> Result<(), TransportError> {
        let this = Arc::clone(self);
        let conn = pool
            .current(move |next| {
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.bind(&next).await });
            })
            .await?;
        self.bind(&conn).await;
        Ok(())
    }

    async fn bind(self: &Arc<Self>, conn: &ConnectionHandle) {
        if !self.claim(conn.index()) {
            debug!(
                contract = %self.address,
                url = %conn.endpoint().url,
                "already subscribed on this endpoint"
            );
            return;
        }
        match conn.subscribe(self.topic(), self.listener()).await {
            Ok(key) => info!(
                contract = %self.address,
                event = self.event.name,
                url = %conn.endpoint().url,
                %key,
                "listening"
            ),
            Err(TransportError::NotConnected { url }) => info!(
                contract = %self.address,
                event = self.event.name,
                %url,
                "endpoint not open yet, subscription issued once it opens"
            ),
            Err(e) if e.is_terminal() => warn!(
                contract = %self.address,
                event = self.event.name,
                url = %conn.endpoint().url,
                error = %e,
                "endpoint is gone, waiting for the next failover"
            ),
            Err(e) => warn!(
                contract = %self.address,
                event = self.event.name,
                url = %conn.endpoint().url,
                error = %e,
                "subscribe failed"
            ),
        }
    }

    /// `true` the first time `index` is claimed. Swap callbacks can repeat an
    /// endpoint; its registry already replays the subscription.
    fn claim(&self, index: usize) -> bool {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index)
    }

    fn listener(self: &Arc<Self>) -> Listener {
        let this = Arc::clone(self);
        Arc::new(move |log: Value| this.on_log(&log))
    }

    fn on_log(&self, log: &Value) {
        match self.event.decode_log(log) {
            Ok(Some(event)) => {
                let receivers = self.bus.publish(TRANSACTIONS_TOPIC, event.clone());
                debug!(contract = %self.address, %event, receivers, "published");
            }
            Ok(None) => debug!(contract = %self.address, event = self.event.name, "skipping log"),
            Err(e) => warn!(
                contract = %self.address,
                event = self.event.name,
                error = %e,
                "undecodable log dropped"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use futures::channel::mpsc;
    use futures::{SinkExt, StreamExt};

    use chainrelay_core::RpcClient;
    use chainrelay_ws::{ConnectionConfig, Connector, Endpoint, Frame, PoolConfig, Socket};

    use crate::abi::tests::{address_word, encode, uint_word};

    const SHOP: &str = "0x2222222222222222222222222222222222222222";

    fn purchase_log() -> Value {
        json!({
            "address": SHOP,
            "topics": [ITEM_PURCHASED.topic0()],
            "data": encode(&[
                Ok(address_word(0xaa)),
                Ok(uint_word(3)),
                Err("Fragment"),
                Ok(uint_word(1_000_000)),
                Err("tg-1001"),
            ]),
            "removed": false,
        })
    }

    #[test]
    fn decodes_purchase() {
        let event = ITEM_PURCHASED.decode_log(&purchase_log()).unwrap();
        assert_eq!(
            event,
            Some(DomainEvent::PurchaseItem { user_id: "tg-1001".into(), item_id: 3 })
        );
    }

    #[test]
    fn decodes_check_in() {
        let log = json!({
            "topics": [CHECKED_IN.topic0()],
            "data": encode(&[
                Ok(address_word(0xaa)),
                Ok(address_word(0xbb)),
                Ok(uint_word(1_717_000_000)),
                Ok(uint_word(7)),
                Err("tg-42"),
            ]),
        });
        assert_eq!(
            CHECKED_IN.decode_log(&log).unwrap(),
            Some(DomainEvent::CheckIn { user_id: "tg-42".into() })
        );
    }

    #[test]
    fn skips_removed_and_foreign_logs() {
        let mut removed = purchase_log();
        removed["removed"] = json!(true);
        assert_eq!(ITEM_PURCHASED.decode_log(&removed).unwrap(), None);

        // a purchase log is not a check-in
        assert_eq!(CHECKED_IN.decode_log(&purchase_log()).unwrap(), None);
    }

    #[test]
    fn truncated_data_is_an_error() {
        let log = json!({ "topics": [CHECKED_IN.topic0()], "data": "0x00" });
        assert!(CHECKED_IN.decode_log(&log).is_err());
    }

    #[test]
    fn subscription_filter() {
        let bus = Arc::new(EventBus::new(4));
        let listener = ContractListener::new(SHOP, &ITEM_PURCHASED, bus);
        let topic = listener.topic();
        assert_eq!(topic.kind, "logs");
        assert_eq!(
            topic.params,
            vec![json!({ "address": SHOP, "topics": [ITEM_PURCHASED.topic0()] })]
        );
    }

    #[test]
    fn claims_each_endpoint_once() {
        let listener = ContractListener::new(SHOP, &ITEM_PURCHASED, Arc::new(EventBus::new(4)));
        assert!(listener.claim(0));
        assert!(listener.claim(1));
        assert!(!listener.claim(0));
    }

    /// Server end of one in-memory socket.
    struct Server {
        incoming: mpsc::UnboundedReceiver<Frame>,
        outgoing: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    }

    impl Server {
        async fn next_request(&mut self) -> Value {
            loop {
                match self.incoming.next().await {
                    Some(Frame::Text(text)) => return serde_json::from_str(&text).unwrap(),
                    Some(_) => continue,
                    None => panic!("client closed the socket"),
                }
            }
        }

        fn send(&self, message: Value) {
            let _ = self.outgoing.unbounded_send(Ok(Frame::Text(message.to_string())));
        }
    }

    /// Accepts every dial and hands the server end to the test.
    struct Accepting(tokio::sync::mpsc::UnboundedSender<(String, Server)>);

    #[async_trait::async_trait]
    impl Connector for Accepting {
        async fn connect(&self, url: &str) -> Result<Socket, TransportError> {
            let (to_server, incoming) = mpsc::unbounded::<Frame>();
            let (outgoing, from_server) = mpsc::unbounded::<Result<Frame, TransportError>>();
            let sink = to_server.sink_map_err(|e| TransportError::WebSocket(e.to_string()));
            let _ = self.0.send((url.to_string(), Server { incoming, outgoing }));
            Ok(Socket::new(Box::pin(sink), Box::pin(from_server)))
        }
    }

    /// One failure ends an endpoint; heartbeats stay out of the way.
    fn single_shot() -> PoolConfig {
        PoolConfig {
            connection: ConnectionConfig {
                max_reconnect_attempts: 1,
                heartbeat_interval: Duration::from_secs(3600),
                pong_timeout: Duration::from_secs(3600),
                ..ConnectionConfig::default()
            },
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn follows_failover_and_subscribes_once_per_endpoint() {
        let (tx, mut accepted) = tokio::sync::mpsc::unbounded_channel();
        let endpoints = ["ws://a", "ws://b", "ws://c"].map(Endpoint::new).to_vec();
        let pool = Arc::new(
            ConnectionPool::connect(endpoints, single_shot(), Arc::new(Accepting(tx)))
                .await
                .unwrap(),
        );
        let mut servers = HashMap::new();
        for _ in 0..3 {
            let (url, server) = accepted.recv().await.unwrap();
            servers.insert(url, server);
        }
        assert_eq!(pool.active_index(), 0);

        let bus = Arc::new(EventBus::new(8));
        let mut events = bus.receiver(TRANSACTIONS_TOPIC);
        let listener = ContractListener::new(SHOP, &ITEM_PURCHASED, Arc::clone(&bus));
        let started = tokio::spawn({
            let (listener, pool) = (Arc::clone(&listener), Arc::clone(&pool));
            async move { listener.start(&pool).await }
        });

        // bound on the active connection first
        let mut a = servers.remove("ws://a").unwrap();
        let sub_a = a.next_request().await;
        assert_eq!(sub_a["method"], "eth_subscribe");
        assert_eq!(
            sub_a["params"],
            json!(["logs", { "address": SHOP, "topics": [ITEM_PURCHASED.topic0()] }])
        );
        a.send(json!({ "jsonrpc": "2.0", "id": sub_a["id"], "result": "0xa" }));
        started.await.unwrap().unwrap();

        // B terminates: the swap skips it and hands over C
        drop(servers.remove("ws://b"));
        let mut c = servers.remove("ws://c").unwrap();
        let sub_c = c.next_request().await;
        assert_eq!(sub_c["method"], "eth_subscribe");
        assert_eq!(sub_c["params"], sub_a["params"]);
        c.send(json!({ "jsonrpc": "2.0", "id": sub_c["id"], "result": "0xc" }));
        c.send(json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": { "subscription": "0xc", "result": purchase_log() },
        }));
        assert_eq!(
            events.recv().await.unwrap(),
            DomainEvent::PurchaseItem { user_id: "tg-1001".into(), item_id: 3 }
        );

        // C terminates: the swap lands back on A, which already holds the filter
        drop(c);
        while pool.active_index() != 0 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // the next frame A sees is this request, not a second eth_subscribe
        let handle = pool.handles()[0].clone();
        let block = tokio::spawn(async move { handle.request("eth_blockNumber", vec![]).await });
        let next = a.next_request().await;
        assert_eq!(next["method"], "eth_blockNumber");
        a.send(json!({ "jsonrpc": "2.0", "id": next["id"], "result": "0x10" }));
        assert_eq!(block.await.unwrap().unwrap(), json!("0x10"));
    }

    #[tokio::test]
    async fn decoded_logs_reach_the_bus() {
        let bus = Arc::new(EventBus::new(4));
        let mut rx = bus.receiver(TRANSACTIONS_TOPIC);
        let listener = ContractListener::new(SHOP, &ITEM_PURCHASED, Arc::clone(&bus));

        (listener.listener())(purchase_log());
        (listener.listener())(json!({ "data": "0xnothex" }));

        assert_eq!(
            rx.recv().await.unwrap(),
            DomainEvent::PurchaseItem { user_id: "tg-1001".into(), item_id: 3 }
        );
        assert!(rx.try_recv().is_err());
    }
}
