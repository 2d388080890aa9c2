//! Response eligibility policy.
//!
//! Checks run in a fixed order and the first decisive one wins:
//! self → type allow-list → content filters → probability gate → default.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use mk_protocol::{Message, MessageType};

/// `[policy]` configuration table.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Message types eligible for a response.
    #[serde(default = "default_message_types")]
    pub message_types: Vec<MessageType>,
    /// Case-insensitive substrings that force a response.
    #[serde(default)]
    pub content_filters: Vec<String>,
    /// Chance of responding when no filter matched, in `[0, 1]`.
    #[serde(default = "default_probability")]
    pub probability: f64,
    #[serde(default = "default_respond")]
    pub default_respond: bool,
}

fn default_message_types() -> Vec<MessageType> {
    vec![MessageType::General]
}

fn default_probability() -> f64 {
    1.0
}

fn default_respond() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            message_types: default_message_types(),
            content_filters: Vec::new(),
            probability: default_probability(),
            default_respond: default_respond(),
        }
    }
}

/// Outcome of a policy evaluation, with the rule that decided it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    RejectSelf,
    RejectType(MessageType),
    AcceptFilter(String),
    RejectProbability,
    Default(bool),
}

impl Decision {
    pub fn responds(&self) -> bool {
        matches!(self, Self::AcceptFilter(_) | Self::Default(true))
    }
}

/// Evaluate `message` against `config` as seen by device `self_id`.
///
/// Pure apart from the random draw, which only happens when no filter
/// matched and `probability < 1`.
pub fn evaluate<R: Rng>(
    message: &Message,
    self_id: &str,
    config: &PolicyConfig,
    rng: &mut R,
) -> Decision {
    if message.sender_id == self_id {
        return Decision::RejectSelf;
    }

    if !config.message_types.contains(&message.message_type) {
        return Decision::RejectType(message.message_type);
    }

    let content = message.content.as_text().to_lowercase();
    if let Some(filter) = config
        .content_filters
        .iter()
        .find(|f| !f.is_empty() && content.contains(&f.to_lowercase()))
    {
        return Decision::AcceptFilter(filter.clone());
    }

    if config.probability < 1.0 && rng.r#gen::<f64>() >= config.probability {
        return Decision::RejectProbability;
    }

    Decision::Default(config.default_respond)
}

pub fn should_respond<R: Rng>(
    message: &Message,
    self_id: &str,
    config: &PolicyConfig,
    rng: &mut R,
) -> bool {
    evaluate(message, self_id, config, rng).responds()
}

/// Policy bound to its configuration and random source.
#[derive(Debug)]
pub struct ResponsePolicy {
    config: PolicyConfig,
    rng: Mutex<StdRng>,
}

impl ResponsePolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic policy for tests and reproducible runs.
    pub fn seeded(config: PolicyConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn evaluate(&self, message: &Message, self_id: &str) -> Decision {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        evaluate(message, self_id, &self.config, &mut *rng)
    }
}
