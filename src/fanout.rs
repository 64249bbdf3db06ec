//! Concurrent calls joined into one result.
//!
//! Every call runs on its own task, so when one call fails the aggregate
//! returns that error at once while the siblings keep running to completion
//! and clean up their own reply subscriptions.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::dispatcher::RequestDispatcher;
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};

struct PlannedCall {
    label: String,
    topic: String,
    payload: Envelope,
}

/// Fail-fast fan-out over a dispatcher.
pub struct FanOut {
    dispatcher: RequestDispatcher,
    timeout: Duration,
    calls: Vec<PlannedCall>,
}

impl FanOut {
    pub fn new(dispatcher: &RequestDispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            timeout: dispatcher.default_timeout(),
            calls: Vec::new(),
        }
    }

    /// Deadline applied to each call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a call whose result is reported under `label`.
    pub fn call(mut self, label: impl Into<String>, topic: impl Into<String>, payload: Envelope) -> Self {
        self.calls.push(PlannedCall {
            label: label.into(),
            topic: topic.into(),
            payload,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Issue every call concurrently; results come back in the order added.
    ///
    /// The first failure is returned without waiting for the other calls.
    pub async fn join(self) -> Result<Vec<(String, Envelope)>> {
        let mut labels = Vec::with_capacity(self.calls.len());
        let mut in_flight = FuturesUnordered::new();

        for (index, planned) in self.calls.into_iter().enumerate() {
            let PlannedCall {
                label,
                topic,
                payload,
            } = planned;
            let dispatcher = self.dispatcher.clone();
            let timeout = self.timeout;
            let call_topic = topic.clone();
            let task =
                tokio::spawn(async move { dispatcher.call(&call_topic, payload, timeout).await });
            labels.push(label);
            in_flight.push(async move { (index, topic, task.await) });
        }

        let mut results: Vec<Option<Envelope>> = vec![None; labels.len()];
        while let Some((index, topic, joined)) = in_flight.next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(BridgeError::Handler {
                    topic: topic.clone(),
                    message: e.to_string(),
                })
            });
            match outcome {
                Ok(reply) => results[index] = Some(reply),
                Err(e) => {
                    debug!(topic = %topic, error = %e, remaining = in_flight.len(), "Fan-out failed fast");
                    return Err(e);
                }
            }
        }

        Ok(labels
            .into_iter()
            .zip(results)
            .filter_map(|(label, reply)| reply.map(|reply| (label, reply)))
            .collect())
    }

    /// `join`, keyed by label.
    pub async fn join_map(self) -> Result<BTreeMap<String, Envelope>> {
        Ok(self.join().await?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelBroker;
    use crate::connection::Connection;
    use crate::pending::PendingTable;
    use crate::router::{respond_fn, RouterBuilder};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn connect(broker: &ChannelBroker) -> Connection {
        Connection::new(Arc::new(broker.connect().unwrap()))
    }

    async fn start_workers(broker: &ChannelBroker) -> crate::router::RouterHandle {
        RouterBuilder::new()
            .register(
                "user/test",
                respond_fn(|_req: Envelope| async move {
                    Ok(Envelope::new().with_status(200).with("service", "user"))
                }),
            )
            .unwrap()
            .register(
                "admin/test",
                respond_fn(|_req: Envelope| async move {
                    Ok(Envelope::new().with_status(200).with("service", "admin"))
                }),
            )
            .unwrap()
            .register(
                "chat/test",
                respond_fn(|req: Envelope| async move {
                    Ok(req.error_reply(500, "chat is down"))
                }),
            )
            .unwrap()
            .build()
            .start(connect(broker))
            .await
            .unwrap()
    }

    fn dispatcher(broker: &ChannelBroker) -> RequestDispatcher {
        RequestDispatcher::new(
            connect(broker),
            Arc::new(PendingTable::new()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_join_preserves_call_order() {
        let broker = ChannelBroker::new();
        let _workers = start_workers(&broker).await;
        let dispatcher = dispatcher(&broker);

        let results = FanOut::new(&dispatcher)
            .call("admin", "admin/test", Envelope::request())
            .call("user", "user/test", Envelope::request())
            .join()
            .await
            .unwrap();

        let labels: Vec<_> = results.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["admin", "user"]);
        assert_eq!(results[0].1.get_str("service"), Some("admin"));
        assert_eq!(results[1].1.get_str("service"), Some("user"));
        assert!(dispatcher.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_leaves_siblings_running() {
        let broker = ChannelBroker::new();
        let _workers = start_workers(&broker).await;
        let dispatcher = dispatcher(&broker);

        let started = Instant::now();
        let err = FanOut::new(&dispatcher)
            .with_timeout(Duration::from_secs(10))
            .call("chat", "chat/test", Envelope::request())
            .call("ad", "ad/test", Envelope::request())
            .join_map()
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Remote { status: 500, .. }));
        assert!(started.elapsed() < Duration::from_secs(1));

        // The unanswered sibling is still waiting, then times out on its own
        assert_eq!(dispatcher.pending().len(), 1);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(dispatcher.pending().is_empty());
        assert_eq!(broker.subscription_count(), 3);
    }

    #[tokio::test]
    async fn test_empty_fan_out() {
        let broker = ChannelBroker::new();
        let dispatcher = dispatcher(&broker);
        let fan_out = FanOut::new(&dispatcher);
        assert!(fan_out.is_empty());
        assert!(fan_out.join().await.unwrap().is_empty());
    }
}
