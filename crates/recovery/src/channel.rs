//! Channel handles that record what they declare.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use warren_connection::{
    Channel, ChannelId, ChannelState, ConsumeOptions, Consumer, ExchangeDeclareOptions,
    FieldTable, PublishOptions, QueueDeclareOk, QueueDeclareOptions, Result, ShutdownReason,
    delivery_channel,
};

use crate::{
    connection::Inner,
    record::{Prefetch, RecordedChannel},
    topology::{RecordedBinding, RecordedConsumer, RecordedExchange, RecordedQueue},
};

/// A channel whose topology is replayed after connection recovery.
///
/// Every successful declaration is recorded in the connection's
/// [`TopologyRegistry`](crate::TopologyRegistry) and every delete removes it again. After
/// recovery the handle transparently refers to the replacement channel. Operations issued
/// while recovery is running fail like they would on the closed channel.
#[derive(Clone)]
pub struct RecoverableChannel {
    conn: Arc<Inner>,
    recorded: Arc<RecordedChannel>,
}

impl fmt::Debug for RecoverableChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverableChannel")
            .field("channel", &self.recorded.channel())
            .finish()
    }
}

impl RecoverableChannel {
    pub(crate) fn new(conn: Arc<Inner>, recorded: Arc<RecordedChannel>) -> Self {
        Self { conn, recorded }
    }

    /// The underlying channel of the current connection.
    pub fn channel(&self) -> Channel {
        self.recorded.channel()
    }

    pub fn id(&self) -> ChannelId {
        self.recorded.id()
    }

    pub fn state(&self) -> ChannelState {
        self.channel().state()
    }

    pub fn is_open(&self) -> bool {
        self.channel().is_open()
    }

    pub fn close_reason(&self) -> Option<ShutdownReason> {
        self.channel().close_reason()
    }

    /// Close the channel. It is not reopened by later recoveries.
    pub async fn close(&self) -> Result<()> {
        self.conn.forget_channel(&self.recorded);
        self.channel().close().await
    }

    pub async fn exchange_declare(
        &self,
        exchange: &str,
        kind: &str,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel()
            .exchange_declare(exchange, kind, options, arguments.clone())
            .await?;
        if !options.passive {
            self.conn.registry().record_exchange(RecordedExchange {
                name: exchange.to_string(),
                kind: kind.to_string(),
                options,
                arguments,
            });
        }
        Ok(())
    }

    pub async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<()> {
        self.channel().exchange_delete(exchange, if_unused).await?;
        self.conn.registry().delete_exchange(exchange);
        Ok(())
    }

    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel()
            .exchange_bind(destination, source, routing_key, arguments.clone())
            .await?;
        self.conn.registry().record_binding(RecordedBinding::exchange(
            destination,
            source,
            routing_key,
            arguments,
        ));
        Ok(())
    }

    /// Declare a queue. A queue declared with an empty name is recorded as server-named and
    /// gets a fresh name on recovery.
    pub async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk> {
        let declared = self
            .channel()
            .queue_declare(queue, options, arguments.clone())
            .await?;
        if !options.passive {
            self.conn.registry().record_queue(RecordedQueue {
                name: declared.queue.clone(),
                server_named: queue.is_empty(),
                options,
                arguments,
            });
        }
        Ok(declared)
    }

    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel()
            .queue_bind(queue, exchange, routing_key, arguments.clone())
            .await?;
        self.conn
            .registry()
            .record_binding(RecordedBinding::queue(queue, exchange, routing_key, arguments));
        Ok(())
    }

    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.channel()
            .queue_unbind(queue, exchange, routing_key, arguments.clone())
            .await?;
        self.conn
            .registry()
            .delete_binding(&RecordedBinding::queue(queue, exchange, routing_key, arguments));
        Ok(())
    }

    pub async fn queue_purge(&self, queue: &str) -> Result<u32> {
        self.channel().queue_purge(queue).await
    }

    pub async fn queue_delete(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let deleted = self.channel().queue_delete(queue, if_unused, if_empty).await?;
        self.conn.registry().delete_queue(queue);
        Ok(deleted)
    }

    /// Set the prefetch window. Reapplied to the replacement channel on recovery.
    pub async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<()> {
        self.channel().basic_qos(prefetch_count, global).await?;
        self.recorded.set_prefetch(Prefetch {
            count: prefetch_count,
            global,
        });
        Ok(())
    }

    /// Start a consumer whose stream keeps delivering across recoveries.
    pub async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: FieldTable,
    ) -> Result<Consumer> {
        let channel = self.channel();
        let (sink, rx) = delivery_channel();
        let tag = channel
            .basic_consume_with_sink(queue, consumer_tag, options, arguments.clone(), sink.clone())
            .await?;
        self.conn.registry().record_consumer(RecordedConsumer {
            tag: tag.clone(),
            server_named: consumer_tag.is_empty(),
            channel: channel.id(),
            queue: queue.to_string(),
            options,
            arguments,
            sink,
        });
        Ok(Consumer::new(tag, channel.id(), rx))
    }

    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel().basic_cancel(consumer_tag).await?;
        self.conn.registry().delete_consumer(consumer_tag);
        Ok(())
    }

    pub fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        properties: Bytes,
        body: Bytes,
    ) -> Result<()> {
        self.channel()
            .basic_publish(exchange, routing_key, options, properties, body)
    }

    pub fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.channel().basic_ack(delivery_tag, multiple)
    }

    pub fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.channel().basic_nack(delivery_tag, multiple, requeue)
    }

    pub fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel().basic_reject(delivery_tag, requeue)
    }
}
