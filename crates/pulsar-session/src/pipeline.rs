//! The ingress pipeline: a bounded queue between the transport readers and
//! the single dispatch task.
//!
//! Every transport reader pushes decoded packets into one bounded channel;
//! one consumer drains it in arrival order. Packets from the same peer are
//! therefore dispatched in the order that peer's reader produced them, and
//! a full queue applies backpressure to the reader instead of dropping or
//! buffering without bound.

use pulsar_proto::{Packet, PeerId};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Which transport a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// The ordered stream.
    Reliable,
    /// The datagram path.
    Unreliable,
}

/// One decoded packet queued for dispatch.
#[derive(Debug)]
pub struct IngressItem {
    /// The peer whose reader produced it, as recorded by the transport
    /// layer. Dispatch trusts this over anything in the packet body.
    pub peer: PeerId,
    /// The connection generation the packet arrived under. A peer id can
    /// be recycled while packets from its previous holder are still
    /// queued; dispatch drops items whose generation no longer matches
    /// the live connection.
    pub generation: u64,
    pub transport: Transport,
    pub packet: Packet,
}

/// Errors raised when submitting to the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The consumer is gone; the session is shutting down.
    #[error("ingress pipeline closed")]
    Closed,
}

/// The producing half, cloned into every transport reader.
#[derive(Clone)]
pub struct IngressSender {
    tx: mpsc::Sender<IngressItem>,
}

impl IngressSender {
    /// Queue a packet for dispatch, waiting if the queue is full.
    pub async fn submit(&self, item: IngressItem) -> Result<(), PipelineError> {
        self.tx.send(item).await.map_err(|_| PipelineError::Closed)
    }
}

/// The consuming half, owned by the dispatch task.
pub struct Pipeline {
    rx: mpsc::Receiver<IngressItem>,
}

impl Pipeline {
    /// Create a pipeline with the given queue capacity.
    pub fn new(capacity: usize) -> (IngressSender, Pipeline) {
        let (tx, rx) = mpsc::channel(capacity);
        (IngressSender { tx }, Pipeline { rx })
    }

    /// Receive the next queued packet, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<IngressItem> {
        self.rx.recv().await
    }

    /// Drain the queue into `handle` until shutdown is signalled or every
    /// sender is dropped.
    pub async fn run<F>(mut self, mut shutdown: watch::Receiver<bool>, mut handle: F)
    where
        F: FnMut(IngressItem),
    {
        loop {
            tokio::select! {
                item = self.rx.recv() => {
                    match item {
                        Some(item) => handle(item),
                        None => {
                            debug!("ingress pipeline drained, all producers gone");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("ingress pipeline stopping on shutdown signal");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsar_proto::{CacheMode, Packet};

    fn call(sender: u16, rpc_id: u8) -> IngressItem {
        IngressItem {
            peer: PeerId(sender),
            generation: 1,
            transport: Transport::Reliable,
            packet: Packet::GlobalRpc {
                sender: PeerId(sender),
                cache: CacheMode::None,
                rpc_id,
                args: vec![],
            },
        }
    }

    #[tokio::test]
    async fn test_packets_dispatch_in_submission_order() {
        let (tx, mut pipeline) = Pipeline::new(16);
        for rpc_id in 0..5u8 {
            tx.submit(call(1, rpc_id)).await.unwrap();
        }

        for expected in 0..5u8 {
            let item = pipeline.recv().await.unwrap();
            match item.packet {
                Packet::GlobalRpc { rpc_id, .. } => assert_eq!(rpc_id, expected),
                other => panic!("unexpected packet {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_submit_after_consumer_drop_reports_closed() {
        let (tx, pipeline) = Pipeline::new(4);
        drop(pipeline);
        let result = tx.submit(call(1, 0)).await;
        assert!(matches!(result, Err(PipelineError::Closed)));
    }

    #[tokio::test]
    async fn test_recv_ends_when_all_producers_drop() {
        let (tx, mut pipeline) = Pipeline::new(4);
        tx.submit(call(1, 0)).await.unwrap();
        drop(tx);

        assert!(pipeline.recv().await.is_some());
        assert!(pipeline.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let (tx, pipeline) = Pipeline::new(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(pipeline.run(shutdown_rx, |_| {}));
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        drop(tx);
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let (tx, mut pipeline) = Pipeline::new(1);
        tx.submit(call(1, 0)).await.unwrap();

        // Second submit must wait until the consumer makes room.
        let tx2 = tx.clone();
        let submit = tokio::spawn(async move { tx2.submit(call(1, 1)).await });
        tokio::task::yield_now().await;
        assert!(!submit.is_finished());

        pipeline.recv().await.unwrap();
        submit.await.unwrap().unwrap();
    }
}
