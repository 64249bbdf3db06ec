//! Diagnostic "hello" exchange used to check the whole setup.
//!
//! Every worker answers on its `<service>/test` topic; the gateway-side
//! probe greets all of them concurrently and collects the replies.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::dispatcher::RequestDispatcher;
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::fanout::FanOut;
use crate::router::{respond_fn, HandlerBundle, ReplyHandler};
use crate::topics::TopicRegistry;

/// Name the probe signs its greetings with.
pub const GATEWAY_NAME: &str = "Gateway";

/// `"user"` -> `"User Service"`.
pub fn display_name(service: &str) -> String {
    let mut chars = service.chars();
    match chars.next() {
        Some(first) => format!("{}{} Service", first.to_uppercase(), chars.as_str()),
        None => "Service".to_string(),
    }
}

fn required_text<'a>(request: &'a Envelope, field: &str) -> Option<&'a str> {
    request.get_str(field).filter(|value| !value.is_empty())
}

/// Answer a greeting on behalf of `service`.
///
/// Missing or non-string `message`/`name` yields a 400 with an error message.
pub fn say_hello(service: &str, request: &Envelope) -> Envelope {
    let Some(message) = required_text(request, "message") else {
        return Envelope::new()
            .with_error("No message provided")
            .with_status(400);
    };
    let Some(name) = required_text(request, "name") else {
        return Envelope::new()
            .with_error("No name provided")
            .with_status(400);
    };

    info!(service = %service, from = %name, "{} says: {}", name, message);
    Envelope::new()
        .with("message", format!("Hello, {}!", name))
        .with_status(200)
        .with("name", display_name(service))
}

pub fn hello_handler(service: &str) -> impl ReplyHandler {
    let service = service.to_string();
    respond_fn(move |request: Envelope| {
        let response = say_hello(&service, &request);
        async move { Ok(response) }
    })
}

/// The hello handler bound to the service's diagnostic topic.
pub fn bundle(registry: &TopicRegistry, service: &str) -> Result<HandlerBundle> {
    let set = registry.set(service)?;
    let topic = set.test_topic().ok_or_else(|| BridgeError::TopicNotFound {
        set: service.to_string(),
        topic: format!("{}/test", service),
    })?;

    let handler: Arc<dyn ReplyHandler> = Arc::new(hello_handler(service));
    Ok(vec![(topic.to_string(), handler)])
}

/// Greeting sent by the probe to one service.
pub fn greeting(service: &str) -> Envelope {
    Envelope::request()
        .with("name", GATEWAY_NAME)
        .with("message", format!("Hello {} service", service))
}

/// Greet every service with a diagnostic topic and collect the reply bodies.
///
/// Fails fast on the first call error or non-success status.
pub async fn probe_all(
    dispatcher: &RequestDispatcher,
    registry: &TopicRegistry,
) -> Result<BTreeMap<String, Envelope>> {
    let fan_out = registry
        .sets()
        .filter_map(|set| set.test_topic().map(|topic| (set.name(), topic)))
        .fold(FanOut::new(dispatcher), |fan_out, (name, topic)| {
            fan_out.call(name, topic, greeting(name))
        });

    let replies = fan_out.join().await?;
    let mut bodies = BTreeMap::new();
    for (service, reply) in replies {
        reply.check_status(&service)?;
        bodies.insert(service, reply.into_body());
    }
    Ok(bodies)
}
