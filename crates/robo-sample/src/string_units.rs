//! # String Producer and Consumer
//!
//! A pair of units for exercising message flow. The producer turns each
//! [`ProducerCommand::SendRandom`] into a random string for its `target`; the consumer
//! keeps every string it receives.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use robo_runtime::{
    AttributeDescriptor, AttributeKey, AttributeValue, Configuration, ConfigurationError,
    DeliveryPolicy, Unit, UnitContext, UnitError,
};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

pub const KEY_TARGET: &str = "target";

const RANDOM_MESSAGE_LEN: usize = 10;

/// Messages accepted by [`StringProducer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerCommand {
    SendRandom,
}

fn random_message() -> String {
    let mut message = Uuid::new_v4().simple().to_string();
    message.truncate(RANDOM_MESSAGE_LEN);
    message
}

#[derive(Default)]
pub struct StringProducer {
    sent: AtomicUsize,
}

impl StringProducer {
    pub const TOTAL_MESSAGES: AttributeDescriptor<usize> =
        AttributeDescriptor::new("total_messages");

    pub fn new() -> Self {
        Self::default()
    }
}

impl Unit for StringProducer {
    type Message = ProducerCommand;

    fn on_initialization(
        &self,
        _ctx: &UnitContext<'_>,
        config: &Configuration,
    ) -> Result<(), ConfigurationError> {
        config.require_string(KEY_TARGET).map(|_| ())
    }

    fn on_message(&self, ctx: &UnitContext<'_>, command: ProducerCommand) -> Result<(), UnitError> {
        match command {
            ProducerCommand::SendRandom => {
                let target_id = ctx.configuration().get_string(KEY_TARGET, "");
                let target = ctx
                    .reference::<String>(&target_id)
                    .ok_or_else(|| format!("producer target {target_id} does not exist"))?;
                let message = random_message();
                trace!(unit = %ctx.id(), target = %target_id, %message, "Sending");
                target.send_message(message);
                self.sent.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn known_attributes(&self) -> Vec<AttributeKey> {
        vec![Self::TOTAL_MESSAGES.key()]
    }

    fn on_get_attribute(&self, key: &AttributeKey) -> Option<AttributeValue> {
        key.matches(&Self::TOTAL_MESSAGES)
            .then(|| Self::TOTAL_MESSAGES.value(self.sent.load(Ordering::SeqCst)))
    }
}

/// Records every string it receives. Runs on the work pool.
#[derive(Default)]
pub struct StringConsumer {
    received: Mutex<Vec<String>>,
}

impl StringConsumer {
    pub const TOTAL_MESSAGES: AttributeDescriptor<usize> =
        AttributeDescriptor::new("total_messages");
    pub const RECEIVED_MESSAGES: AttributeDescriptor<Vec<String>> =
        AttributeDescriptor::new("received_messages");

    pub fn new() -> Self {
        Self::default()
    }
}

impl Unit for StringConsumer {
    type Message = String;
    const DELIVERY: DeliveryPolicy = DeliveryPolicy::Work;

    fn on_message(&self, _ctx: &UnitContext<'_>, message: String) -> Result<(), UnitError> {
        self.received.lock().push(message);
        Ok(())
    }

    fn known_attributes(&self) -> Vec<AttributeKey> {
        vec![Self::TOTAL_MESSAGES.key(), Self::RECEIVED_MESSAGES.key()]
    }

    fn on_get_attribute(&self, key: &AttributeKey) -> Option<AttributeValue> {
        let received = self.received.lock();
        if key.matches(&Self::TOTAL_MESSAGES) {
            Some(Self::TOTAL_MESSAGES.value(received.len()))
        } else if key.matches(&Self::RECEIVED_MESSAGES) {
            Some(Self::RECEIVED_MESSAGES.value(received.clone()))
        } else {
            None
        }
    }
}
