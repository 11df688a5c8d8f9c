//! The recovery engine: reconnect with backoff, then replay recorded state onto the
//! replacement connection.
//!
//! Replay order is dependency order: exchanges, queues, bindings (on a temporary channel),
//! then the application's channels with their prefetch settings, then consumers.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::watch;
use tracing::{debug, info, warn};
use warren_connection::{
    Channel, ChannelId, Connection, ConnectionConfig, ConnectionError, ConnectionEvent,
    EventDispatcher,
};
use warren_primitives::{Connector, Negotiator};

use crate::{
    error::{RecoveryError, Result},
    metrics::RecoveryMetrics,
    policy::RetryPolicy,
    record::RecoveryRecord,
    topology::{BindingDestination, TopologyRegistry},
};

/// Outcome of a successful recovery.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub(crate) connection: Connection,
    /// Connect attempts it took, counting the successful one.
    pub(crate) attempts: u32,
}

pub(crate) struct RecoveryEngine {
    pub(crate) config: Arc<ConnectionConfig>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) negotiator: Arc<dyn Negotiator>,
    pub(crate) events: Arc<EventDispatcher>,
    pub(crate) policy: RetryPolicy,
    pub(crate) metrics: RecoveryMetrics,
}

impl std::fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RecoveryEngine {
    pub(crate) fn is_enabled(&self) -> bool {
        self.config.recovery.enabled
    }

    /// Reconnect and replay. The replacement connection is aborted if replay fails.
    pub(crate) async fn recover(
        &self,
        registry: &dyn TopologyRegistry,
        record: &RecoveryRecord,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Recovered> {
        let (connection, attempts) = self.reconnect(cancel).await?;
        if let Err(e) = self.replay(&connection, registry, record).await {
            let _ = connection.abort().await;
            return Err(e);
        }
        Ok(Recovered {
            connection,
            attempts,
        })
    }

    /// Open a replacement connection, waiting out the backoff before every attempt.
    async fn reconnect(&self, cancel: &mut watch::Receiver<bool>) -> Result<(Connection, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let backoff = self.policy.backoff_for_attempt(attempt);
            debug!(attempt, ?backoff, "Waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancelled(cancel) => return Err(RecoveryError::Cancelled),
            }

            self.metrics.attempts_total.increment(1);
            match Connection::open_with_events(
                self.config.clone(),
                self.connector.clone(),
                self.negotiator.clone(),
                self.events.clone(),
            )
            .await
            {
                Ok(connection) => return Ok((connection, attempt)),
                Err(last) if attempt >= self.policy.max_attempts => {
                    return Err(RecoveryError::RetriesExhausted {
                        attempts: attempt,
                        last,
                    });
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    async fn replay(
        &self,
        connection: &Connection,
        registry: &dyn TopologyRegistry,
        record: &RecoveryRecord,
    ) -> Result<()> {
        let topology = self.config.recovery.topology;
        if topology {
            self.replay_topology(connection, registry, record).await?;
        }
        let reopened = reopen_channels(connection, record).await?;
        if topology {
            self.replay_consumers(registry, &reopened).await?;
        }
        Ok(())
    }

    /// Redeclare exchanges, queues and bindings on a channel of their own.
    async fn replay_topology(
        &self,
        connection: &Connection,
        registry: &dyn TopologyRegistry,
        record: &RecoveryRecord,
    ) -> Result<()> {
        let snapshot = registry.snapshot();
        if snapshot.exchanges.is_empty() && snapshot.queues.is_empty() && snapshot.bindings.is_empty()
        {
            return Ok(());
        }

        let number = record.free_number(connection.channel_max());
        let channel = connection
            .open_channel(number)
            .await
            .map_err(RecoveryError::replay("topology channel"))?;
        let result = self.declare_topology(&channel, registry).await;
        if let Err(e) = channel.close().await {
            debug!(channel = channel.id(), error = %e, "Failed to close topology channel");
        }
        result
    }

    async fn declare_topology(&self, channel: &Channel, registry: &dyn TopologyRegistry) -> Result<()> {
        let snapshot = registry.snapshot();
        for exchange in &snapshot.exchanges {
            channel
                .exchange_declare(
                    &exchange.name,
                    &exchange.kind,
                    exchange.options,
                    exchange.arguments.clone(),
                )
                .await
                .map_err(RecoveryError::replay(format!("exchange '{}'", exchange.name)))?;
        }
        debug!(exchanges = snapshot.exchanges.len(), "Exchanges redeclared");

        for queue in &snapshot.queues {
            let requested = if queue.server_named { "" } else { queue.name.as_str() };
            let declared = channel
                .queue_declare(requested, queue.options, queue.arguments.clone())
                .await
                .map_err(RecoveryError::replay(format!("queue '{}'", queue.name)))?;
            if declared.queue != queue.name {
                debug!(old = %queue.name, new = %declared.queue, "Queue name changed");
                registry.queue_renamed(&queue.name, &declared.queue);
                self.events.dispatch(&ConnectionEvent::QueueNameChanged {
                    old: queue.name.clone(),
                    new: declared.queue,
                });
            }
        }
        debug!(queues = snapshot.queues.len(), "Queues redeclared");

        // Taken again so bindings see renamed queues.
        let bindings = registry.snapshot().bindings;
        for binding in &bindings {
            let entity = format!(
                "binding '{}' -> '{}' ({})",
                binding.source, binding.destination, binding.routing_key
            );
            let bound = match binding.destination_kind {
                BindingDestination::Queue => {
                    channel
                        .queue_bind(
                            &binding.destination,
                            &binding.source,
                            &binding.routing_key,
                            binding.arguments.clone(),
                        )
                        .await
                }
                BindingDestination::Exchange => {
                    channel
                        .exchange_bind(
                            &binding.destination,
                            &binding.source,
                            &binding.routing_key,
                            binding.arguments.clone(),
                        )
                        .await
                }
            };
            bound.map_err(RecoveryError::replay(entity))?;
        }
        debug!(bindings = bindings.len(), "Bindings redeclared");
        Ok(())
    }

    /// Re-register consumers on the reopened channels, feeding their existing sinks.
    async fn replay_consumers(
        &self,
        registry: &dyn TopologyRegistry,
        reopened: &HashMap<ChannelId, Channel>,
    ) -> Result<()> {
        for consumer in registry.snapshot().consumers {
            if consumer.is_abandoned() {
                debug!(tag = %consumer.tag, "Dropping consumer nobody reads from");
                registry.delete_consumer(&consumer.tag);
                continue;
            }
            let Some(channel) = reopened.get(&consumer.channel) else {
                warn!(tag = %consumer.tag, channel = consumer.channel, "Consumer channel not recorded");
                registry.delete_consumer(&consumer.tag);
                continue;
            };

            let requested = if consumer.server_named { "" } else { consumer.tag.as_str() };
            let tag = channel
                .basic_consume_with_sink(
                    &consumer.queue,
                    requested,
                    consumer.options,
                    consumer.arguments.clone(),
                    consumer.sink.clone(),
                )
                .await
                .map_err(RecoveryError::replay(format!("consumer '{}'", consumer.tag)))?;
            registry.consumer_moved(&consumer.tag, &tag, channel.id());
            if tag != consumer.tag {
                debug!(old = %consumer.tag, new = %tag, "Consumer tag changed");
                self.events.dispatch(&ConnectionEvent::ConsumerTagChanged {
                    old: consumer.tag,
                    new: tag,
                });
            }
        }
        Ok(())
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

/// Reopen every recorded channel, on its old number where the new connection allows it.
///
/// Returns the replacement channels keyed by their old numbers.
async fn reopen_channels(
    connection: &Connection,
    record: &RecoveryRecord,
) -> Result<HashMap<ChannelId, Channel>> {
    let mut reopened = HashMap::new();
    for recorded in record.channels() {
        let old = recorded.id();
        let channel = match connection.open_channel(Some(old)).await {
            Ok(channel) => channel,
            Err(ConnectionError::ChannelOutOfRange { .. }) => connection
                .create_channel()
                .await
                .map_err(RecoveryError::replay(format!("channel {old}")))?,
            Err(e) => return Err(RecoveryError::replay(format!("channel {old}"))(e)),
        };
        if channel.id() != old {
            info!(old, new = channel.id(), "Channel reopened on a different number");
        }
        if let Some(prefetch) = recorded.prefetch() {
            channel
                .basic_qos(prefetch.count, prefetch.global)
                .await
                .map_err(RecoveryError::replay(format!("prefetch of channel {old}")))?;
        }
        recorded.replace(channel.clone());
        reopened.insert(old, channel);
    }
    record.resort();
    debug!(channels = reopened.len(), "Channels reopened");
    Ok(reopened)
}
