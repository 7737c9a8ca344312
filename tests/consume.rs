// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{orders_config, InMemoryBroker};
use rabbitmq_manager::{broker::Broker, AmqpError, Delivery, RabbitMQManager};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

async fn manager_over(broker: &Arc<InMemoryBroker>) -> RabbitMQManager {
    RabbitMQManager::with_broker(orders_config(), broker.clone() as Arc<dyn Broker>)
        .await
        .unwrap()
}

#[tokio::test]
async fn acked_messages_leave_the_queue() {
    let broker = Arc::new(InMemoryBroker::ending_streams());
    let manager = manager_over(&broker).await;
    manager.publish("orders", "orders.new", b"one").await.unwrap();
    manager.publish("orders", "orders.new", b"two").await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handled = manager
        .start_consuming("new_orders", move |delivery: Delivery| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(delivery.body.clone());
                delivery.ack().await
            }
        })
        .await
        .unwrap();

    assert_eq!(handled, 2);
    assert_eq!(*seen.lock().unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
    assert_eq!(broker.unacked(), 0);
    assert_eq!(manager.get_queue_info("new_orders").await.unwrap().message_count, 0);
}

#[tokio::test]
async fn rejected_messages_are_dead_lettered() {
    let broker = Arc::new(InMemoryBroker::ending_streams());
    let manager = manager_over(&broker).await;
    manager.publish("orders", "orders.new", b"poison").await.unwrap();

    manager
        .start_consuming("new_orders", |delivery: Delivery| async move {
            delivery.reject(false).await
        })
        .await
        .unwrap();

    let dead = broker.messages("orders_dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, b"poison".to_vec());
    assert_eq!(dead[0].routing_key, "dead_letter");
    assert!(broker.bodies("new_orders").is_empty());

    let deaths = Arc::new(Mutex::new(0));
    let counter = deaths.clone();
    manager
        .start_consuming("orders_dlq", move |delivery: Delivery| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() = delivery.death_count();
                delivery.ack().await
            }
        })
        .await
        .unwrap();
    assert_eq!(*deaths.lock().unwrap(), 1);
}

#[tokio::test]
async fn requeued_messages_come_back_redelivered() {
    let broker = Arc::new(InMemoryBroker::ending_streams());
    let manager = manager_over(&broker).await;
    manager.publish("orders", "orders.pending", b"retry").await.unwrap();

    manager
        .start_consuming("pending_orders", |delivery: Delivery| async move {
            delivery.nack(true).await
        })
        .await
        .unwrap();

    let back = broker.messages("pending_orders");
    assert_eq!(back.len(), 1);
    assert!(back[0].redelivered);
    assert!(broker.messages("orders_dlq").is_empty());
}

#[tokio::test]
async fn handler_errors_do_not_stop_consumption() {
    let broker = Arc::new(InMemoryBroker::ending_streams());
    let manager = manager_over(&broker).await;
    for body in [b"bad".as_slice(), b"good".as_slice()] {
        manager.publish("orders", "orders.new", body).await.unwrap();
    }

    let handled = manager
        .start_consuming("new_orders", |delivery: Delivery| async move {
            if delivery.body == b"bad" {
                return Err(AmqpError::configuration("cannot parse order"));
            }
            delivery.ack().await
        })
        .await
        .unwrap();

    assert_eq!(handled, 2);
    // the failed delivery is left unsettled
    assert_eq!(broker.unacked(), 1);
}

#[tokio::test]
async fn shutdown_cancels_the_consumer() {
    let broker = Arc::new(InMemoryBroker::new());
    let manager = manager_over(&broker).await;
    manager.publish("orders", "orders.new", b"only").await.unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let tx = Mutex::new(Some(tx));
    let handled = manager
        .start_consuming_until(
            "new_orders",
            move |delivery: Delivery| {
                let stop = tx.lock().unwrap().take();
                async move {
                    delivery.ack().await?;
                    if let Some(stop) = stop {
                        let _ = stop.send(());
                    }
                    Ok::<(), AmqpError>(())
                }
            },
            async {
                let _ = rx.await;
            },
        )
        .await
        .unwrap();

    assert_eq!(handled, 1);
    assert_eq!(broker.cancelled().len(), 1);
    assert!(broker.cancelled()[0].starts_with("rabbitmq-manager-"));
    assert_eq!(manager.get_queue_info("new_orders").await.unwrap().consumer_count, 0);
}

#[tokio::test]
async fn consuming_a_missing_queue_fails() {
    let broker = Arc::new(InMemoryBroker::ending_streams());
    let manager = manager_over(&broker).await;

    let err = manager
        .start_consuming("missing", |delivery: Delivery| async move { delivery.ack().await })
        .await
        .unwrap_err();

    assert!(err.is_connection());
}
