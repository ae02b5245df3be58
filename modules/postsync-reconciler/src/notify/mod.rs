pub mod backend;
pub mod noop;
pub mod webhook;

pub use backend::Broadcaster;
pub use noop::NoopBroadcaster;
pub use webhook::WebhookBroadcaster;
