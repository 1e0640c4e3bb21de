pub mod hold;
pub mod order;
pub mod webhook;

pub use hold::HoldEngine;
pub use order::OrderEngine;
pub use webhook::{WebhookEngine, WebhookOutcome};
