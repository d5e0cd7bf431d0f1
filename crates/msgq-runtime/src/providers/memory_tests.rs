//! Tests for the in-memory broker.

use super::*;
use crate::destination::Queue;
use crate::message::Timestamp;
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

struct RecordingSink {
    delivered: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(&self, message: Message) {
        let _ = self.delivered.send(message);
    }

    fn message_available(&self) {}
}

struct IgnoreExceptions;

#[async_trait]
impl ExceptionSink for IgnoreExceptions {
    async fn on_exception(&self, _error: MessagingError) {}
}

struct Client {
    connection: Arc<dyn BrokerConnection>,
    session: Arc<dyn BrokerSession>,
    delivered: mpsc::UnboundedReceiver<Message>,
}

async fn client(broker: &InMemoryBroker, transacted: bool) -> Client {
    let connector = InMemoryConnector::new(broker.clone());
    let connection = connector
        .connect(&FactoryConfig::default(), Arc::new(IgnoreExceptions))
        .await
        .unwrap();
    let (tx, delivered) = mpsc::unbounded_channel();
    let mode = if transacted { AckMode::Transacted } else { AckMode::Client };
    let session = connection
        .create_session(mode, transacted, Arc::new(RecordingSink { delivered: tx }))
        .await
        .unwrap();
    session.start().await.unwrap();
    Client {
        connection,
        session,
        delivered,
    }
}

fn queue(name: &str) -> Destination {
    Queue::new(name).unwrap().into()
}

fn topic(name: &str) -> Destination {
    Topic::new(name).unwrap().into()
}

fn addressed(destination: &Destination, body: &str) -> Message {
    let mut message = Message::text(body);
    message.destination = Some(destination.clone());
    message.message_id = Some(crate::message::MessageId::new());
    message
}

fn body(message: &Message) -> &str {
    message.body_text().unwrap()
}

// ============================================================================
// Queue Tests
// ============================================================================

mod queues {
    use super::*;

    #[tokio::test]
    async fn test_competing_consumers_each_get_a_message_once() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let b = client(&broker, false).await;
        let orders = queue("orders");
        let first = a.session.create_consumer(&orders, None, false).await.unwrap();
        let second = b.session.create_consumer(&orders, None, false).await.unwrap();

        a.session.send(&addressed(&orders, "one")).await.unwrap();
        a.session.send(&addressed(&orders, "two")).await.unwrap();
        assert_eq!(broker.queue_depth(&orders), 2);

        let got_a = a.session.receive_no_wait(&first).await.unwrap().unwrap();
        let got_b = b.session.receive_no_wait(&second).await.unwrap().unwrap();
        assert_eq!(body(&got_a), "one");
        assert_eq!(body(&got_b), "two");
        assert!(a.session.receive_no_wait(&first).await.unwrap().is_none());
        assert_eq!(broker.queue_depth(&orders), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_sends() {
        let broker = InMemoryBroker::new(InMemoryConfig { max_queue_size: 2 });
        let a = client(&broker, false).await;
        let orders = queue("orders");

        a.session.send(&addressed(&orders, "1")).await.unwrap();
        a.session.send(&addressed(&orders, "2")).await.unwrap();
        let result = a.session.send(&addressed(&orders, "3")).await;

        match result {
            Err(MessagingError::ProviderError { code, .. }) => assert_eq!(code, "QueueFull"),
            other => panic!("expected QueueFull, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_requires_destination() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;

        let result = a.session.send(&Message::text("nowhere")).await;
        assert!(matches!(result, Err(MessagingError::InvalidDestination { .. })));
    }

    #[tokio::test]
    async fn test_expired_messages_are_discarded() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let orders = queue("orders");
        let consumer = a.session.create_consumer(&orders, None, false).await.unwrap();

        let mut stale = addressed(&orders, "stale");
        stale.expiration = Some(Timestamp::now().add(chrono::Duration::milliseconds(-1)));
        a.session.send(&stale).await.unwrap();
        a.session.send(&addressed(&orders, "fresh")).await.unwrap();

        let message = a.session.receive_no_wait(&consumer).await.unwrap().unwrap();
        assert_eq!(body(&message), "fresh");
    }

    #[tokio::test]
    async fn test_browser_sees_queue_without_consuming() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let orders = queue("orders");
        for i in 0..5 {
            a.session.send(&addressed(&orders, &i.to_string())).await.unwrap();
        }
        let browser = a.session.create_browser(&orders, None).await.unwrap();

        let first = a.session.browse(&browser, 3).await.unwrap();
        let rest = a.session.browse(&browser, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(rest.len(), 2);
        assert!(a.session.browse(&browser, 3).await.unwrap().is_empty());
        assert_eq!(broker.queue_depth(&orders), 5);

        let result = a.session.receive_no_wait(&browser).await.unwrap();
        assert!(result.is_none());
        assert!(a.session.set_asynchronous(&browser, true).await.is_err());
    }
}

// ============================================================================
// Topic Tests
// ============================================================================

mod topics {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_gets_a_copy() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let b = client(&broker, false).await;
        let prices = topic("prices");
        let first = a.session.create_consumer(&prices, None, false).await.unwrap();
        let second = b.session.create_consumer(&prices, None, false).await.unwrap();

        a.session.send(&addressed(&prices, "tick")).await.unwrap();

        assert!(a.session.receive_no_wait(&first).await.unwrap().is_some());
        assert!(b.session.receive_no_wait(&second).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_messages_before_subscription_are_not_seen() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let prices = topic("prices");

        a.session.send(&addressed(&prices, "early")).await.unwrap();
        let late = a.session.create_consumer(&prices, None, false).await.unwrap();
        assert!(a.session.receive_no_wait(&late).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wildcard_subscription_routing() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let single = a
            .session
            .create_consumer(&topic("prices.*"), None, false)
            .await
            .unwrap();
        let deep = a
            .session
            .create_consumer(&topic("prices.**"), None, false)
            .await
            .unwrap();

        a.session.send(&addressed(&topic("prices.eur"), "eur")).await.unwrap();
        a.session
            .send(&addressed(&topic("prices.eur.spot"), "spot"))
            .await
            .unwrap();
        a.session.send(&addressed(&topic("volumes.eur"), "vol")).await.unwrap();

        let mut single_seen = Vec::new();
        while let Some(m) = a.session.receive_no_wait(&single).await.unwrap() {
            single_seen.push(body(&m).to_string());
        }
        let mut deep_seen = Vec::new();
        while let Some(m) = a.session.receive_no_wait(&deep).await.unwrap() {
            deep_seen.push(body(&m).to_string());
        }
        assert_eq!(single_seen, vec!["eur"]);
        assert_eq!(deep_seen, vec!["eur", "spot"]);
    }

    #[tokio::test]
    async fn test_no_local_suppresses_own_connection() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let b = client(&broker, false).await;
        let prices = topic("prices");
        let local = a.session.create_consumer(&prices, None, true).await.unwrap();

        a.session.send(&addressed(&prices, "mine")).await.unwrap();
        b.session.send(&addressed(&prices, "theirs")).await.unwrap();

        let message = a.session.receive_no_wait(&local).await.unwrap().unwrap();
        assert_eq!(body(&message), "theirs");
        assert!(a.session.receive_no_wait(&local).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_selector_applies_to_topic_routing() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let prices = topic("prices");
        let urgent = a
            .session
            .create_consumer(&prices, Some("JMSPriority >= 7"), false)
            .await
            .unwrap();

        let mut high = addressed(&prices, "high");
        high.priority = crate::message::Priority::new(9).unwrap();
        a.session.send(&addressed(&prices, "normal")).await.unwrap();
        a.session.send(&high).await.unwrap();

        let message = a.session.receive_no_wait(&urgent).await.unwrap().unwrap();
        assert_eq!(body(&message), "high");
    }

    #[tokio::test]
    async fn test_malformed_selector_is_rejected() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;

        let result = a.session.create_consumer(&topic("prices"), Some("AND"), false).await;
        assert!(matches!(result, Err(MessagingError::InvalidSelector { .. })));

        // Blank selectors mean no selector
        assert!(a.session.create_consumer(&topic("prices"), Some("  "), false).await.is_ok());
    }
}

// ============================================================================
// Durable Subscription Tests
// ============================================================================

mod durable {
    use super::*;

    #[tokio::test]
    async fn test_durable_subscription_retains_while_inactive() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let prices = Topic::new("prices").unwrap();
        let dest: Destination = prices.clone().into();

        let consumer = a
            .session
            .create_durable_consumer(&prices, "ticker", None, false)
            .await
            .unwrap();
        a.session.close_consumer(&consumer).await.unwrap();

        a.session.send(&addressed(&dest, "while away")).await.unwrap();
        assert_eq!(broker.durable_depth(None, "ticker"), Some(1));

        let resumed = a
            .session
            .create_durable_consumer(&prices, "ticker", None, false)
            .await
            .unwrap();
        let message = a.session.receive_no_wait(&resumed).await.unwrap().unwrap();
        assert_eq!(body(&message), "while away");
    }

    #[tokio::test]
    async fn test_durable_subscription_allows_one_active_consumer() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let prices = Topic::new("prices").unwrap();

        a.session
            .create_durable_consumer(&prices, "ticker", None, false)
            .await
            .unwrap();
        let result = a
            .session
            .create_durable_consumer(&prices, "ticker", None, false)
            .await;
        assert!(matches!(result, Err(MessagingError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_changed_topic_replaces_subscription() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let prices = Topic::new("prices").unwrap();

        let consumer = a
            .session
            .create_durable_consumer(&prices, "ticker", None, false)
            .await
            .unwrap();
        a.session.close_consumer(&consumer).await.unwrap();
        let dest: Destination = prices.clone().into();
        a.session.send(&addressed(&dest, "old")).await.unwrap();

        let volumes = Topic::new("volumes").unwrap();
        let replaced = a
            .session
            .create_durable_consumer(&volumes, "ticker", None, false)
            .await
            .unwrap();
        assert!(a.session.receive_no_wait(&replaced).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscriptions_are_scoped_by_client_id() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        a.connection.set_client_id("alpha").await.unwrap();
        let prices = Topic::new("prices").unwrap();

        let consumer = a
            .session
            .create_durable_consumer(&prices, "ticker", None, false)
            .await
            .unwrap();
        a.session.close_consumer(&consumer).await.unwrap();

        assert_eq!(broker.durable_depth(Some("alpha"), "ticker"), Some(0));
        assert_eq!(broker.durable_depth(None, "ticker"), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_rules() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let prices = Topic::new("prices").unwrap();

        let result = a.session.unsubscribe("missing").await;
        assert!(matches!(result, Err(MessagingError::InvalidDestination { .. })));

        let consumer = a
            .session
            .create_durable_consumer(&prices, "ticker", None, false)
            .await
            .unwrap();
        let result = a.session.unsubscribe("ticker").await;
        assert!(matches!(result, Err(MessagingError::InvalidState { .. })));

        a.session.close_consumer(&consumer).await.unwrap();
        a.session.unsubscribe("ticker").await.unwrap();
        assert_eq!(broker.durable_depth(None, "ticker"), None);
    }
}

// ============================================================================
// Acknowledgment and Transaction Tests
// ============================================================================

mod acknowledgment {
    use super::*;

    #[tokio::test]
    async fn test_acknowledge_is_cumulative_and_recover_redelivers_rest() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let orders = queue("orders");
        let consumer = a.session.create_consumer(&orders, None, false).await.unwrap();
        for text in ["a", "b", "c"] {
            a.session.send(&addressed(&orders, text)).await.unwrap();
        }

        let _first = a.session.receive_no_wait(&consumer).await.unwrap().unwrap();
        let second = a.session.receive_no_wait(&consumer).await.unwrap().unwrap();
        let _third = a.session.receive_no_wait(&consumer).await.unwrap().unwrap();
        a.session
            .acknowledge(&consumer, second.ack_token.unwrap())
            .await
            .unwrap();

        a.session.recover().await.unwrap();
        let again = a.session.receive_no_wait(&consumer).await.unwrap().unwrap();
        assert_eq!(body(&again), "c");
        assert!(again.redelivered);
        assert!(a.session.receive_no_wait(&consumer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_preserves_delivery_order() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let orders = queue("orders");
        let consumer = a.session.create_consumer(&orders, None, false).await.unwrap();
        for text in ["a", "b", "c"] {
            a.session.send(&addressed(&orders, text)).await.unwrap();
        }
        a.session.receive_no_wait(&consumer).await.unwrap();
        a.session.receive_no_wait(&consumer).await.unwrap();

        a.session.recover().await.unwrap();

        let mut bodies = Vec::new();
        while let Some(m) = a.session.receive_no_wait(&consumer).await.unwrap() {
            bodies.push(body(&m).to_string());
        }
        assert_eq!(bodies, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_transacted_sends_publish_on_commit() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, true).await;
        let orders = queue("orders");

        a.session.send(&addressed(&orders, "staged")).await.unwrap();
        assert_eq!(broker.queue_depth(&orders), 0);

        a.session.commit().await.unwrap();
        assert_eq!(broker.queue_depth(&orders), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_and_redelivers_received() {
        let broker = InMemoryBroker::default();
        let producer = client(&broker, false).await;
        let a = client(&broker, true).await;
        let orders = queue("orders");
        producer.session.send(&addressed(&orders, "work")).await.unwrap();
        let consumer = a.session.create_consumer(&orders, None, false).await.unwrap();

        a.session.receive_no_wait(&consumer).await.unwrap().unwrap();
        a.session.send(&addressed(&orders, "staged")).await.unwrap();
        a.session.rollback().await.unwrap();

        assert_eq!(broker.queue_depth(&orders), 1);
        let again = a.session.receive_no_wait(&consumer).await.unwrap().unwrap();
        assert_eq!(body(&again), "work");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_closing_session_returns_unacknowledged() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let orders = queue("orders");
        let consumer = a.session.create_consumer(&orders, None, false).await.unwrap();
        a.session.send(&addressed(&orders, "held")).await.unwrap();
        a.session.receive_no_wait(&consumer).await.unwrap().unwrap();
        assert_eq!(broker.queue_depth(&orders), 0);

        a.session.close().await.unwrap();
        assert_eq!(broker.queue_depth(&orders), 1);
    }
}

// ============================================================================
// Push Delivery and Connection Tests
// ============================================================================

mod push_delivery {
    use super::*;

    #[tokio::test]
    async fn test_asynchronous_consumer_gets_pushed_messages() {
        let broker = InMemoryBroker::default();
        let mut a = client(&broker, false).await;
        let orders = queue("orders");
        let consumer = a.session.create_consumer(&orders, None, false).await.unwrap();
        a.session.set_asynchronous(&consumer, true).await.unwrap();

        a.session.send(&addressed(&orders, "pushed")).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), a.delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body(&message), "pushed");
        assert_eq!(message.consumer_id.as_ref(), Some(&consumer));
        assert!(message.ack_token.is_some());

        let result = a.session.receive_no_wait(&consumer).await;
        assert!(matches!(result, Err(MessagingError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_stopped_session_is_not_pushed_to() {
        let broker = InMemoryBroker::default();
        let mut a = client(&broker, false).await;
        let orders = queue("orders");
        let consumer = a.session.create_consumer(&orders, None, false).await.unwrap();
        a.session.set_asynchronous(&consumer, true).await.unwrap();
        a.session.stop().await.unwrap();

        a.session.send(&addressed(&orders, "held")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(a.delivered.try_recv().is_err());
        assert_eq!(broker.queue_depth(&orders), 1);

        a.session.start().await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(1), a.delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body(&message), "held");
    }

    #[tokio::test]
    async fn test_client_id_must_be_unique() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        let b = client(&broker, false).await;

        a.connection.set_client_id("alpha").await.unwrap();
        let result = b.connection.set_client_id("alpha").await;
        match result {
            Err(MessagingError::ProviderError { code, .. }) => assert_eq!(code, "InvalidClientId"),
            other => panic!("expected InvalidClientId, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_connection_is_forgotten() {
        let broker = InMemoryBroker::default();
        let a = client(&broker, false).await;
        assert_eq!(broker.connection_count(), 1);

        a.connection.close().await.unwrap();
        a.connection.close().await.unwrap();
        assert_eq!(broker.connection_count(), 0);
        assert!(!broker.drop_connection(a.connection.connection_id()).await);
    }
}
