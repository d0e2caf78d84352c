//! Declarative broker topology: queues, exchanges, and bindings.
//!
//! The publisher never touches topology at runtime; this helper exists for
//! tests and deployment setup code that need to build or tear down the
//! queues a workload publishes into.

use lapin::options::{
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::ExchangeKind;

use crate::pool::ChannelPool;
use crate::{Error, Result};

/// Declares and tears down broker topology over borrowed channels from a
/// [`ChannelPool`].
pub struct Topologer {
    channels: ChannelPool,
}

impl Topologer {
    pub fn new(channels: ChannelPool) -> Self {
        Self { channels }
    }

    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        let channel = self.channels.get_channel().await?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(Error::Topology)?;
        tracing::debug!(queue = name, durable, "declared queue");
        Ok(())
    }

    pub async fn purge_queue(&self, name: &str) -> Result<()> {
        let channel = self.channels.get_channel().await?;
        channel
            .queue_purge(name, QueuePurgeOptions::default())
            .await
            .map_err(Error::Topology)?;
        tracing::debug!(queue = name, "purged queue");
        Ok(())
    }

    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        let channel = self.channels.get_channel().await?;
        channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(Error::Topology)?;
        tracing::debug!(queue = name, "deleted queue");
        Ok(())
    }

    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<()> {
        let channel = self.channels.get_channel().await?;
        channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(Error::Topology)?;
        tracing::debug!(exchange = name, "declared exchange");
        Ok(())
    }

    pub async fn delete_exchange(&self, name: &str) -> Result<()> {
        let channel = self.channels.get_channel().await?;
        channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(Error::Topology)?;
        tracing::debug!(exchange = name, "deleted exchange");
        Ok(())
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.channels.get_channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(Error::Topology)?;
        tracing::debug!(queue, exchange, routing_key, "bound queue");
        Ok(())
    }
}
