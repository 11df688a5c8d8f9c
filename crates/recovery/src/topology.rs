//! Topology recording.
//!
//! Every exchange, queue, binding and consumer the application declares through a
//! [`RecoverableChannel`](crate::RecoverableChannel) is recorded here, and every delete
//! removes the record again, so that recovery replays exactly what was live when the
//! connection dropped.

use std::fmt;

use parking_lot::Mutex;
use warren_connection::{
    ChannelId, ConsumeOptions, DeliverySink, ExchangeDeclareOptions, FieldTable,
    QueueDeclareOptions,
};

/// Prefix of the exchanges every broker predeclares.
const PREDECLARED_PREFIX: &str = "amq.";

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExchange {
    pub name: String,
    pub kind: String,
    pub options: ExchangeDeclareOptions,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQueue {
    /// The name the queue has on the broker right now.
    pub name: String,
    /// The broker picked the name; replay asks for a fresh one.
    pub server_named: bool,
    pub options: QueueDeclareOptions,
    pub arguments: FieldTable,
}

/// What a binding routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingDestination {
    Queue,
    Exchange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBinding {
    pub source: String,
    pub destination: String,
    pub destination_kind: BindingDestination,
    pub routing_key: String,
    pub arguments: FieldTable,
}

impl RecordedBinding {
    pub fn queue(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Self {
        Self {
            source: exchange.into(),
            destination: queue.into(),
            destination_kind: BindingDestination::Queue,
            routing_key: routing_key.into(),
            arguments,
        }
    }

    pub fn exchange(
        destination: impl Into<String>,
        source: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            destination_kind: BindingDestination::Exchange,
            routing_key: routing_key.into(),
            arguments,
        }
    }

    fn targets_queue(&self, queue: &str) -> bool {
        self.destination_kind == BindingDestination::Queue && self.destination == queue
    }

    fn involves_exchange(&self, exchange: &str) -> bool {
        self.source == exchange
            || (self.destination_kind == BindingDestination::Exchange
                && self.destination == exchange)
    }
}

/// An active consumer and the sink its deliveries flow into.
///
/// The sink outlives the channel it was registered on: after recovery the replacement
/// consumer feeds the same stream the application is already reading.
#[derive(Clone)]
pub struct RecordedConsumer {
    pub tag: String,
    /// The broker generated the tag; replay asks for a fresh one.
    pub server_named: bool,
    pub channel: ChannelId,
    pub queue: String,
    pub options: ConsumeOptions,
    pub arguments: FieldTable,
    pub sink: DeliverySink,
}

impl fmt::Debug for RecordedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordedConsumer")
            .field("tag", &self.tag)
            .field("channel", &self.channel)
            .field("queue", &self.queue)
            .field("abandoned", &self.is_abandoned())
            .finish_non_exhaustive()
    }
}

impl RecordedConsumer {
    /// The application dropped the consumer stream; nothing would read a replayed consumer.
    pub fn is_abandoned(&self) -> bool {
        self.sink.is_closed()
    }
}

/// Point-in-time copy of the recorded topology, each list in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    pub exchanges: Vec<RecordedExchange>,
    pub queues: Vec<RecordedQueue>,
    pub bindings: Vec<RecordedBinding>,
    pub consumers: Vec<RecordedConsumer>,
}

impl TopologySnapshot {
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
            && self.queues.is_empty()
            && self.bindings.is_empty()
            && self.consumers.is_empty()
    }
}

/// Store of declared topology consulted by the recovery engine.
///
/// [`TopologyRecorder`] is the in-memory implementation used by default.
pub trait TopologyRegistry: Send + Sync + fmt::Debug {
    fn record_exchange(&self, exchange: RecordedExchange);

    /// Forget an exchange and every binding it takes part in.
    fn delete_exchange(&self, name: &str);

    fn record_queue(&self, queue: RecordedQueue);

    /// Forget a queue with its bindings and consumers.
    fn delete_queue(&self, name: &str);

    fn record_binding(&self, binding: RecordedBinding);

    fn delete_binding(&self, binding: &RecordedBinding);

    fn record_consumer(&self, consumer: RecordedConsumer);

    /// Forget a cancelled consumer. An auto-delete queue goes with its last consumer.
    fn delete_consumer(&self, tag: &str);

    /// Forget every consumer registered on a channel the application closed.
    fn forget_channel(&self, channel: ChannelId);

    /// A server-named queue was redeclared under a new name.
    fn queue_renamed(&self, old: &str, new: &str);

    /// A consumer was re-registered, possibly with a new tag or on a new channel.
    fn consumer_moved(&self, old_tag: &str, new_tag: &str, channel: ChannelId);

    fn snapshot(&self) -> TopologySnapshot;
}

/// In-memory [`TopologyRegistry`].
#[derive(Debug, Default)]
pub struct TopologyRecorder {
    inner: Mutex<TopologySnapshot>,
}

impl TopologyRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether declaring `exchange` needs recording. The default and `amq.*` exchanges
    /// always exist.
    pub fn is_recordable_exchange(exchange: &str) -> bool {
        !exchange.is_empty() && !exchange.starts_with(PREDECLARED_PREFIX)
    }
}

fn remove_queue(topology: &mut TopologySnapshot, name: &str) {
    topology.queues.retain(|q| q.name != name);
    topology.bindings.retain(|b| !b.targets_queue(name));
    topology.consumers.retain(|c| c.queue != name);
}

/// Drop auto-delete queues among `queues` that no longer have a recorded consumer.
fn collect_auto_deleted(topology: &mut TopologySnapshot, queues: &[String]) {
    for queue in queues {
        let auto_delete = topology
            .queues
            .iter()
            .any(|q| &q.name == queue && q.options.auto_delete);
        let consumed = topology.consumers.iter().any(|c| &c.queue == queue);
        if auto_delete && !consumed {
            remove_queue(topology, queue);
        }
    }
}

impl TopologyRegistry for TopologyRecorder {
    fn record_exchange(&self, exchange: RecordedExchange) {
        if !Self::is_recordable_exchange(&exchange.name) {
            return;
        }
        let mut topology = self.inner.lock();
        match topology.exchanges.iter_mut().find(|e| e.name == exchange.name) {
            Some(existing) => *existing = exchange,
            None => topology.exchanges.push(exchange),
        }
    }

    fn delete_exchange(&self, name: &str) {
        let mut topology = self.inner.lock();
        topology.exchanges.retain(|e| e.name != name);
        topology.bindings.retain(|b| !b.involves_exchange(name));
    }

    fn record_queue(&self, queue: RecordedQueue) {
        let mut topology = self.inner.lock();
        match topology.queues.iter_mut().find(|q| q.name == queue.name) {
            Some(existing) => *existing = queue,
            None => topology.queues.push(queue),
        }
    }

    fn delete_queue(&self, name: &str) {
        remove_queue(&mut self.inner.lock(), name);
    }

    fn record_binding(&self, binding: RecordedBinding) {
        let mut topology = self.inner.lock();
        if !topology.bindings.contains(&binding) {
            topology.bindings.push(binding);
        }
    }

    fn delete_binding(&self, binding: &RecordedBinding) {
        self.inner.lock().bindings.retain(|b| b != binding);
    }

    fn record_consumer(&self, consumer: RecordedConsumer) {
        let mut topology = self.inner.lock();
        topology.consumers.retain(|c| c.tag != consumer.tag);
        topology.consumers.push(consumer);
    }

    fn delete_consumer(&self, tag: &str) {
        let mut topology = self.inner.lock();
        let Some(pos) = topology.consumers.iter().position(|c| c.tag == tag) else {
            return;
        };
        let consumer = topology.consumers.remove(pos);
        collect_auto_deleted(&mut topology, &[consumer.queue]);
    }

    fn forget_channel(&self, channel: ChannelId) {
        let mut topology = self.inner.lock();
        let mut queues = Vec::new();
        topology.consumers.retain(|c| {
            if c.channel == channel {
                queues.push(c.queue.clone());
                return false;
            }
            true
        });
        collect_auto_deleted(&mut topology, &queues);
    }

    fn queue_renamed(&self, old: &str, new: &str) {
        let mut topology = self.inner.lock();
        for queue in topology.queues.iter_mut().filter(|q| q.name == old) {
            queue.name = new.to_string();
        }
        for binding in topology.bindings.iter_mut().filter(|b| b.targets_queue(old)) {
            binding.destination = new.to_string();
        }
        for consumer in topology.consumers.iter_mut().filter(|c| c.queue == old) {
            consumer.queue = new.to_string();
        }
    }

    fn consumer_moved(&self, old_tag: &str, new_tag: &str, channel: ChannelId) {
        let mut topology = self.inner.lock();
        if let Some(consumer) = topology.consumers.iter_mut().find(|c| c.tag == old_tag) {
            consumer.tag = new_tag.to_string();
            consumer.channel = channel;
        }
    }

    fn snapshot(&self) -> TopologySnapshot {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use warren_connection::delivery_channel;

    use super::*;

    fn exchange(name: &str) -> RecordedExchange {
        RecordedExchange {
            name: name.to_string(),
            kind: "direct".to_string(),
            options: ExchangeDeclareOptions::default(),
            arguments: FieldTable::new(),
        }
    }

    fn queue(name: &str, auto_delete: bool) -> RecordedQueue {
        RecordedQueue {
            name: name.to_string(),
            server_named: false,
            options: QueueDeclareOptions {
                auto_delete,
                ..Default::default()
            },
            arguments: FieldTable::new(),
        }
    }

    fn consumer(tag: &str, channel: ChannelId, queue: &str) -> RecordedConsumer {
        let (sink, _) = delivery_channel();
        RecordedConsumer {
            tag: tag.to_string(),
            server_named: false,
            channel,
            queue: queue.to_string(),
            options: ConsumeOptions::default(),
            arguments: FieldTable::new(),
            sink,
        }
    }

    fn names<T>(items: &[T], name: impl Fn(&T) -> &str) -> Vec<String> {
        items.iter().map(|item| name(item).to_string()).collect()
    }

    #[test]
    fn test_predeclared_exchanges_not_recorded() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange(""));
        recorder.record_exchange(exchange("amq.topic"));
        recorder.record_exchange(exchange("orders"));
        recorder.record_exchange(exchange("orders"));

        let snapshot = recorder.snapshot();
        assert_eq!(names(&snapshot.exchanges, |e| &e.name), vec!["orders"]);
    }

    #[test]
    fn test_delete_exchange_drops_its_bindings() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("orders"));
        recorder.record_exchange(exchange("audit"));
        recorder.record_queue(queue("jobs", false));
        recorder.record_binding(RecordedBinding::queue("jobs", "orders", "new", FieldTable::new()));
        recorder.record_binding(RecordedBinding::exchange("orders", "audit", "#", FieldTable::new()));
        recorder.record_binding(RecordedBinding::queue("jobs", "audit", "all", FieldTable::new()));

        recorder.delete_exchange("orders");

        let snapshot = recorder.snapshot();
        assert_eq!(names(&snapshot.exchanges, |e| &e.name), vec!["audit"]);
        assert_eq!(
            snapshot.bindings,
            vec![RecordedBinding::queue("jobs", "audit", "all", FieldTable::new())]
        );
    }

    #[test]
    fn test_delete_queue_drops_bindings_and_consumers() {
        let recorder = TopologyRecorder::new();
        recorder.record_queue(queue("jobs", false));
        recorder.record_queue(queue("logs", false));
        recorder.record_binding(RecordedBinding::queue("jobs", "orders", "new", FieldTable::new()));
        recorder.record_consumer(consumer("c1", 1, "jobs"));
        recorder.record_consumer(consumer("c2", 1, "logs"));

        recorder.delete_queue("jobs");

        let snapshot = recorder.snapshot();
        assert_eq!(names(&snapshot.queues, |q| &q.name), vec!["logs"]);
        assert!(snapshot.bindings.is_empty());
        assert_eq!(names(&snapshot.consumers, |c| &c.tag), vec!["c2"]);
    }

    #[test]
    fn test_auto_delete_queue_goes_with_last_consumer() {
        let recorder = TopologyRecorder::new();
        recorder.record_queue(queue("scratch", true));
        recorder.record_queue(queue("durable", false));
        recorder.record_consumer(consumer("c1", 1, "scratch"));
        recorder.record_consumer(consumer("c2", 2, "scratch"));
        recorder.record_consumer(consumer("c3", 1, "durable"));

        recorder.delete_consumer("c1");
        assert_eq!(recorder.snapshot().queues.len(), 2);

        recorder.forget_channel(2);
        recorder.delete_consumer("c3");

        let snapshot = recorder.snapshot();
        assert_eq!(names(&snapshot.queues, |q| &q.name), vec!["durable"]);
        assert!(snapshot.consumers.is_empty());
    }

    #[test]
    fn test_queue_rename_follows_references() {
        let recorder = TopologyRecorder::new();
        recorder.record_queue(RecordedQueue {
            server_named: true,
            ..queue("amq.gen-1", false)
        });
        recorder.record_binding(RecordedBinding::queue("amq.gen-1", "orders", "new", FieldTable::new()));
        recorder.record_consumer(consumer("c1", 1, "amq.gen-1"));

        recorder.queue_renamed("amq.gen-1", "amq.gen-7");

        let snapshot = recorder.snapshot();
        assert_eq!(names(&snapshot.queues, |q| &q.name), vec!["amq.gen-7"]);
        assert!(snapshot.queues.iter().all(|q| q.server_named));
        assert_eq!(snapshot.bindings[0].destination, "amq.gen-7");
        assert_eq!(snapshot.consumers[0].queue, "amq.gen-7");
    }

    #[test]
    fn test_consumer_moved() {
        let recorder = TopologyRecorder::new();
        recorder.record_consumer(consumer("amq.ctag-1", 5, "jobs"));

        recorder.consumer_moved("amq.ctag-1", "amq.ctag-9", 2);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.consumers[0].tag, "amq.ctag-9");
        assert_eq!(snapshot.consumers[0].channel, 2);
    }

    #[test]
    fn test_abandoned_consumer() {
        let (sink, rx) = delivery_channel();
        let recorded = RecordedConsumer {
            sink,
            ..consumer("c1", 1, "jobs")
        };
        assert!(!recorded.is_abandoned());
        drop(rx);
        assert!(recorded.is_abandoned());
    }
}
