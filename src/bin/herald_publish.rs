//! herald-publish: publish one domain event
//!
//! ```text
//! herald-publish likes.created '{"user_id":"u1","content":"post-123"}'
//! echo '{"user_id":"u1","id":"p1"}' | herald-publish posts.deleted
//! ```
//!
//! The payload must be a JSON object; it is read from stdin when not given as
//! an argument. `topic` and `timestamp` are added by the publisher. Broker
//! settings come from the same configuration as `herald` (HERALD_CONFIG and
//! HERALD__* overrides).

use std::io::Read;

use tracing::{info, warn};

use herald::bus::{init_broker, EventPayload, Publisher};
use herald::config::{Config, MessagingType};
use herald::utils::bootstrap::init_tracing;

fn parse_payload(raw: &str) -> Result<EventPayload, Box<dyn std::error::Error>> {
    if raw.trim().is_empty() {
        return Ok(EventPayload::new());
    }
    match serde_json::from_str(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(format!("payload must be a JSON object, got {}", other).into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let topic = args
        .next()
        .ok_or("usage: herald-publish <topic> [json-payload]")?;
    let raw = match args.next() {
        Some(raw) => raw,
        None => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw)?;
            raw
        }
    };
    let payload = parse_payload(&raw)?;

    let config = Config::load(None)?;
    if config.messaging.messaging_type == MessagingType::Channel {
        warn!("In-process broker selected; the event will not leave this process");
    }

    let broker = init_broker(&config.messaging)
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;
    let publisher = Publisher::with_prefix(broker, &config.messaging.prefix);

    publisher.publish(&topic, payload).await?;
    info!(topic = %topic, "Event published");

    publisher.close().await?;
    Ok(())
}
