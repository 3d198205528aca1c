pub mod client;
pub mod payload;
pub mod router;

pub use client::{MqttEvent, MqttIngestClient, TopicFilter};
pub use payload::PayloadProcessor;
pub use router::TopicRouter;
