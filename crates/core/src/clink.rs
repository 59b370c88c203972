//! Classical channels between nodes.
//!
//! A connection yields two [`ClassicalPort`]s. Sending schedules delivery
//! into the peer's inbox after the channel delay; messages on one channel
//! arrive in send order.

use std::fmt;

use serde::Deserialize;

use crate::{
    builder::{CLinkBuilder, ModelConfig},
    simulation::{Mailbox, Recv, SimContext},
};

/// Opaque classical payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message(Vec<u8>);

impl Message {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(text) => write!(f, "{text}"),
            None => write!(f, "<{} bytes>", self.0.len()),
        }
    }
}

/// Timing model of a classical channel.
pub trait CLinkModel {
    fn kind(&self) -> &str;

    /// One-way delay in ns.
    fn delay(&self) -> u64;
}

/// Channel with a constant one-way delay.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedDelay {
    kind: String,
    delay: u64,
}

impl FixedDelay {
    pub fn new(kind: impl Into<String>, delay: u64) -> Self {
        Self {
            kind: kind.into(),
            delay,
        }
    }
}

impl CLinkModel for FixedDelay {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn delay(&self) -> u64 {
        self.delay
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstantCLinkConfig {}

impl ModelConfig for InstantCLinkConfig {}

/// Delivers in the same instant it sends.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstantCLinkBuilder;

impl CLinkBuilder for InstantCLinkBuilder {
    type Config = InstantCLinkConfig;

    fn build(&self, _a: &str, _b: &str, _config: &Self::Config) -> Box<dyn CLinkModel> {
        Box::new(FixedDelay::new("instant", 0))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultCLinkConfig {
    /// Fixed delay in ns, takes precedence over `length`
    pub delay: Option<u64>,
    /// Fibre length in km
    pub length: f64,
    /// Signal speed in km/s
    pub speed: f64,
}

impl Default for DefaultCLinkConfig {
    fn default() -> Self {
        Self {
            delay: None,
            length: 0.0,
            speed: 200_000.0,
        }
    }
}

impl DefaultCLinkConfig {
    pub fn delay_ns(&self) -> u64 {
        match self.delay {
            Some(delay) => delay,
            None => (self.length / self.speed * 1e9).round() as u64,
        }
    }
}

impl ModelConfig for DefaultCLinkConfig {
    fn validate(&self) -> Result<(), String> {
        if self.length < 0.0 || self.length.is_nan() {
            return Err(format!("length must not be negative, got {}", self.length));
        }
        if self.speed <= 0.0 || self.speed.is_nan() {
            return Err(format!("speed must be positive, got {}", self.speed));
        }
        Ok(())
    }
}

/// Fixed-delay fibre.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCLinkBuilder;

impl CLinkBuilder for DefaultCLinkBuilder {
    type Config = DefaultCLinkConfig;

    fn build(&self, _a: &str, _b: &str, config: &Self::Config) -> Box<dyn CLinkModel> {
        Box::new(FixedDelay::new("default", config.delay_ns()))
    }
}

/// One end of a classical channel.
#[derive(Clone)]
pub struct ClassicalPort {
    local: String,
    remote: String,
    delay: u64,
    sim: SimContext,
    inbox: Mailbox<Message>,
    peer_inbox: Mailbox<Message>,
}

impl ClassicalPort {
    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn delay(&self) -> u64 {
        self.delay
    }

    /// Sends `message` to the remote end; it arrives after the channel delay.
    pub fn send(&self, message: impl Into<Message>) {
        let message = message.into();
        tracing::trace!(
            from = %self.local,
            to = %self.remote,
            bytes = message.as_bytes().len(),
            deliver_at = self.sim.now() + self.delay,
            "Sending classical message"
        );
        let inbox = self.peer_inbox.clone();
        self.sim.schedule_after(self.delay, "clink-deliver", move || {
            inbox.push(message);
        });
    }

    /// Suspends until the next message arrives.
    pub fn recv(&self) -> Recv<Message> {
        self.inbox.recv()
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.inbox.try_recv()
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl fmt::Debug for ClassicalPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassicalPort")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("delay", &self.delay)
            .finish()
    }
}

/// Creates the two ports of a channel between `a` and `b`. The first port
/// belongs to `a`.
pub fn connect(
    sim: &SimContext,
    a: &str,
    b: &str,
    model: &dyn CLinkModel,
) -> (ClassicalPort, ClassicalPort) {
    let (inbox_a, inbox_b) = (Mailbox::new(), Mailbox::new());
    let port = |local: &str,
                remote: &str,
                inbox: &Mailbox<Message>,
                peer: &Mailbox<Message>| ClassicalPort {
        local: local.to_string(),
        remote: remote.to_string(),
        delay: model.delay(),
        sim: sim.clone(),
        inbox: inbox.clone(),
        peer_inbox: peer.clone(),
    };
    (
        port(a, b, &inbox_a, &inbox_b),
        port(b, a, &inbox_b, &inbox_a),
    )
}
