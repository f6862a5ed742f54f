use anyhow::{bail, Result};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;
const PERSISTENT: u8 = 2;

// `Retry::spawn` is deprecated in newer tokio-retry releases; its behaviour is unchanged.
#[allow(deprecated)]
pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

/// Puts the channel in confirm mode so every publish is acked or nacked by the broker.
pub async fn enable_publisher_confirms(channel: &Channel) -> Result<()> {
  channel.confirm_select(ConfirmSelectOptions::default()).await?;
  Ok(())
}

/// Declares the durable job queue; safe to call from every process.
pub async fn declare_task_queue(channel: &Channel, queue: &str) -> Result<u32> {
  let declared = channel
    .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
    .await?;
  Ok(declared.message_count())
}

fn check_confirmation(queue: &str, confirmation: &Confirmation) -> Result<()> {
  if confirmation.is_nack() {
    bail!("broker refused message for queue {}", queue);
  }
  Ok(())
}

#[allow(deprecated)]
pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8]) -> Result<()> {
  let confirmation = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    channel
      .basic_publish(
        "",
        queue,
        BasicPublishOptions::default(),
        payload,
        BasicProperties::default().with_delivery_mode(PERSISTENT),
      )
      .await?
      .await
  })
    .await?;
  check_confirmation(queue, &confirmation)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn nacked_publish_is_an_error() {
    assert!(check_confirmation("q", &Confirmation::Nack(None)).is_err());
    assert!(check_confirmation("q", &Confirmation::Ack(None)).is_ok());
  }
}
