//! TCP front end
//!
//! Each accepted connection gets its own task that decodes client frames,
//! calls into the broker, and forwards the broker's outbound frames back.
//! A malformed frame ends only that connection.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use pulsemq_core::{Broker, OutboundSender};
use pulsemq_types::{ConsumerId, Error};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{self, ClientFrame, ServerFrame, MAX_FRAME_LEN};

/// Accept connections until `shutdown` fires.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let broker = Arc::clone(&broker);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, broker, shutdown).await;
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
        }
    }
    info!("TCP listener stopped");
}

/// Queues this connection registered on, with the consumer id used for each
#[derive(Debug, Default)]
struct Registrations(Vec<(String, ConsumerId)>);

impl Registrations {
    fn consumer_for(&self, queue: &str) -> Option<&ConsumerId> {
        self.0.iter().find(|(q, _)| q == queue).map(|(_, c)| c)
    }

    fn add(&mut self, queue: String, consumer: ConsumerId) {
        if self.consumer_for(&queue).is_none() {
            self.0.push((queue, consumer));
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Arc<Broker>, shutdown: CancellationToken) {
    debug!(peer = %peer, "Connection opened");

    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registrations = Registrations::default();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            inbound = framed.next() => {
                let line = match inbound {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!(peer = %peer, max = MAX_FRAME_LEN, "Frame too long, closing connection");
                        let _ = send(&mut framed, &ServerFrame::error("frame too long")).await;
                        break;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        debug!(peer = %peer, error = %e, "Read failed, closing connection");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let frame = match protocol::decode(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Malformed frame, closing connection");
                        let _ = send(&mut framed, &ServerFrame::error(format!("malformed frame: {e}"))).await;
                        break;
                    }
                };

                let reply = handle_frame(&broker, frame, &tx, &mut registrations);
                if send(&mut framed, &reply).await.is_err() {
                    break;
                }
            }
            Some(outbound) = rx.recv() => {
                let frame = ServerFrame::from(outbound);
                if send(&mut framed, &frame).await.is_err() || frame.closes_connection() {
                    break;
                }
            }
        }
    }

    for (queue, consumer) in &registrations.0 {
        broker.handle_disconnect(queue, consumer, &tx);
    }
    debug!(peer = %peer, queues = registrations.0.len(), "Connection closed");
}

fn handle_frame(
    broker: &Broker,
    frame: ClientFrame,
    tx: &OutboundSender,
    registrations: &mut Registrations,
) -> ServerFrame {
    let result = match frame {
        ClientFrame::Register { queue, consumer_id } => broker
            .handle_register(&queue, consumer_id, tx.clone())
            .and_then(|consumer_id| {
                // A lenient duplicate leaves the session with its own connection
                if !broker.is_attached(&queue, &consumer_id, tx) {
                    return Err(Error::ConsumerAlreadyRegistered(consumer_id.to_string()));
                }
                registrations.add(queue.clone(), consumer_id.clone());
                Ok(ServerFrame::Registered { queue, consumer_id })
            }),
        ClientFrame::Publish {
            queue,
            payload,
            message_id,
        } => broker
            .handle_publish(&queue, payload, message_id)
            .map(|message_id| ServerFrame::Published { queue, message_id }),
        ClientFrame::Ack { queue, message_id } => match registrations.consumer_for(&queue) {
            Some(consumer) => broker
                .handle_ack(&queue, consumer, &message_id)
                .map(|()| ServerFrame::Acked { queue, message_id }),
            None => Err(Error::ConsumerNotFound(format!("connection is not registered on {queue}"))),
        },
        ClientFrame::Ping => registrations
            .0
            .iter()
            .try_for_each(|(queue, consumer)| broker.handle_ping(queue, consumer))
            .map(|()| ServerFrame::Pong),
    };

    result.unwrap_or_else(|e| ServerFrame::error(e))
}

async fn send(framed: &mut Framed<TcpStream, LinesCodec>, frame: &ServerFrame) -> Result<(), LinesCodecError> {
    let line = protocol::encode(frame).map_err(|e| LinesCodecError::Io(std::io::Error::other(e)))?;
    framed.send(line).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulsemq_types::{ErrorMode, MessageId, QueueConfig};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    use super::*;

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                reader: BufReader::new(read),
                writer,
            }
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn send(&mut self, frame: &ClientFrame) {
            self.send_raw(&serde_json::to_string(frame).unwrap()).await;
        }

        /// Next frame, or None once the server closed the connection
        async fn recv(&mut self) -> Option<ServerFrame> {
            let mut line = String::new();
            let read = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            (read > 0).then(|| serde_json::from_str(&line).unwrap())
        }
    }

    async fn start_server(mode: ErrorMode) -> (SocketAddr, Arc<Broker>, CancellationToken) {
        let broker = Arc::new(Broker::new(mode));
        broker.create_queue("orders", QueueConfig::default()).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::clone(&broker), shutdown.clone()));
        (addr, broker, shutdown)
    }

    #[tokio::test]
    async fn test_publish_deliver_ack() {
        let (addr, broker, shutdown) = start_server(ErrorMode::Strict).await;
        let mut consumer = Client::connect(addr).await;
        let mut producer = Client::connect(addr).await;

        consumer
            .send(&ClientFrame::Register {
                queue: "orders".into(),
                consumer_id: Some("worker-1".into()),
            })
            .await;
        assert_eq!(
            consumer.recv().await,
            Some(ServerFrame::Registered {
                queue: "orders".into(),
                consumer_id: "worker-1".into()
            })
        );

        producer
            .send_raw(r#"{"type":"publish","queue":"orders","payload":"order #1"}"#)
            .await;
        let Some(ServerFrame::Published { message_id, .. }) = producer.recv().await else {
            panic!("expected published");
        };

        match consumer.recv().await {
            Some(ServerFrame::Deliver {
                message_id: delivered,
                payload,
                attempt,
                ..
            }) => {
                assert_eq!(delivered, message_id);
                assert_eq!(payload.as_ref(), b"order #1");
                assert_eq!(attempt, 0);
            }
            other => panic!("unexpected {other:?}"),
        }

        consumer
            .send(&ClientFrame::Ack {
                queue: "orders".into(),
                message_id,
            })
            .await;
        assert!(matches!(consumer.recv().await, Some(ServerFrame::Acked { .. })));

        consumer.send(&ClientFrame::Ping).await;
        assert_eq!(consumer.recv().await, Some(ServerFrame::Pong));

        assert_eq!(broker.get_queue("orders").unwrap().stats().acked_total, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_operation_errors_keep_connection_open() {
        let (addr, _broker, shutdown) = start_server(ErrorMode::Strict).await;
        let mut client = Client::connect(addr).await;

        client
            .send(&ClientFrame::Publish {
                queue: "missing".into(),
                payload: "x".into(),
                message_id: None,
            })
            .await;
        assert!(matches!(client.recv().await, Some(ServerFrame::Error { .. })));

        client
            .send(&ClientFrame::Ack {
                queue: "orders".into(),
                message_id: MessageId::new(),
            })
            .await;
        assert!(matches!(client.recv().await, Some(ServerFrame::Error { .. })));

        client.send(&ClientFrame::Ping).await;
        assert_eq!(client.recv().await, Some(ServerFrame::Pong));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_only_that_connection() {
        let (addr, _broker, shutdown) = start_server(ErrorMode::Lenient).await;
        let mut bad = Client::connect(addr).await;
        let mut good = Client::connect(addr).await;

        bad.send_raw("{this is not json").await;
        assert!(matches!(bad.recv().await, Some(ServerFrame::Error { .. })));
        assert_eq!(bad.recv().await, None);

        good.send(&ClientFrame::Ping).await;
        assert_eq!(good.recv().await, Some(ServerFrame::Pong));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_requeues_outstanding() {
        let (addr, broker, shutdown) = start_server(ErrorMode::Lenient).await;
        let queue = broker.get_queue("orders").unwrap();

        let mut consumer = Client::connect(addr).await;
        consumer
            .send(&ClientFrame::Register {
                queue: "orders".into(),
                consumer_id: Some("worker-1".into()),
            })
            .await;
        consumer.recv().await;

        let id = broker
            .handle_publish("orders", bytes::Bytes::from_static(b"job"), None)
            .unwrap();
        assert!(matches!(consumer.recv().await, Some(ServerFrame::Deliver { .. })));

        drop(consumer);
        let requeued = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if queue.consumer_ids().is_empty() {
                    break queue.pending_ids();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(requeued, vec![id]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_register_does_not_share_session() {
        let (addr, broker, shutdown) = start_server(ErrorMode::Lenient).await;
        let queue = broker.get_queue("orders").unwrap();
        let register = ClientFrame::Register {
            queue: "orders".into(),
            consumer_id: Some("worker-1".into()),
        };

        let mut owner = Client::connect(addr).await;
        owner.send(&register).await;
        assert!(matches!(owner.recv().await, Some(ServerFrame::Registered { .. })));

        let mut intruder = Client::connect(addr).await;
        intruder.send(&register).await;
        assert!(matches!(intruder.recv().await, Some(ServerFrame::Error { .. })));

        let id = broker
            .handle_publish("orders", bytes::Bytes::from_static(b"job"), None)
            .unwrap();
        assert!(matches!(owner.recv().await, Some(ServerFrame::Deliver { .. })));

        // The second connection cannot ack on the first one's behalf
        intruder
            .send(&ClientFrame::Ack {
                queue: "orders".into(),
                message_id: id,
            })
            .await;
        assert!(matches!(intruder.recv().await, Some(ServerFrame::Error { .. })));
        assert_eq!(queue.unacked_for(&"worker-1".into()), vec![id]);

        // Nor does its disconnect touch the session
        drop(intruder);
        owner.send(&ClientFrame::Ping).await;
        assert_eq!(owner.recv().await, Some(ServerFrame::Pong));
        assert_eq!(queue.consumer_ids(), vec![ConsumerId::from("worker-1")]);
        assert_eq!(queue.unacked_for(&"worker-1".into()), vec![id]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_queue_stop_sends_shutdown_and_closes() {
        let (addr, broker, shutdown) = start_server(ErrorMode::Lenient).await;
        let mut consumer = Client::connect(addr).await;
        consumer
            .send(&ClientFrame::Register {
                queue: "orders".into(),
                consumer_id: None,
            })
            .await;
        consumer.recv().await;

        broker.remove_queue("orders").await.unwrap();
        assert_eq!(
            consumer.recv().await,
            Some(ServerFrame::Shutdown {
                queue: "orders".into()
            })
        );
        assert_eq!(consumer.recv().await, None);
        shutdown.cancel();
    }
}
