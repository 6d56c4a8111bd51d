use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Url, header};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use toolchat_sse::{Chunks, Sse};
use tracing::Instrument;

use super::{Connection, Outbound, Shared};
use crate::error::{Error, Result};

/// Connects to a server over the HTTP+SSE transport.
///
/// The client keeps a GET stream open. The server first sends an `endpoint`
/// event naming the URL to POST messages to, then delivers every message
/// as a `message` event on the same stream.
pub(crate) async fn connect_sse(
    name: &str,
    url: &str,
    connect_timeout: Duration,
) -> Result<Connection> {
    info!("connecting to MCP server `{name}` at {url}");
    let base = Url::parse(url).map_err(|_| Error::InvalidTarget(url.to_owned()))?;
    let client = Client::new();

    let handshake = async {
        let resp = client
            .get(base.clone())
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;
        let mut sse = Sse::new(Chunks::from_response(resp));
        loop {
            let event = sse
                .next_event()
                .await
                .map_err(|err| Error::Protocol(err.to_string()))?
                .ok_or(Error::Closed)?;
            if event.event.as_deref() == Some("endpoint") {
                let endpoint = resolve_endpoint(&base, &event.data)?;
                return Ok::<_, Error>((sse, endpoint));
            }
            debug!("skipping event before the endpoint: {:?}", event.event);
        }
    };
    let (sse, endpoint) = timeout(connect_timeout, handshake)
        .await
        .map_err(|_| Error::Timeout {
            method: "connect".to_owned(),
            timeout: connect_timeout,
        })??;
    debug!("posting messages to {endpoint}");

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let shared = Shared::new(outbound_tx);
    let span = debug_span!("mcp sse", server = name);

    let reader = tokio::spawn(
        read_events(sse, Arc::clone(&shared)).instrument(span.clone()),
    );
    let writer = tokio::spawn(
        post_messages(client, endpoint, outbound_rx, Arc::clone(&shared))
            .instrument(span),
    );

    Ok(Connection::new(shared, vec![reader, writer], None))
}

fn resolve_endpoint(base: &Url, data: &str) -> Result<Url> {
    base.join(data.trim())
        .map_err(|_| Error::Protocol(format!("invalid endpoint `{data}`")))
}

async fn read_events(mut sse: Sse, shared: Arc<Shared>) {
    loop {
        match sse.next_event().await {
            Ok(Some(event)) => match event.event.as_deref() {
                None | Some("message") => {
                    trace!("received: {}", event.data);
                    shared.dispatch(&event.data);
                }
                Some(other) => debug!("ignoring `{other}` event"),
            },
            Ok(None) => {
                debug!("event stream ended");
                break;
            }
            Err(err) => {
                warn!("event stream failed: {err}");
                break;
            }
        }
    }
    shared.close();
}

async fn post_messages(
    client: Client,
    endpoint: Url,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) {
    // Requests are posted concurrently. Notifications and replies are posted
    // in order, so `notifications/initialized` lands before later requests.
    let mut in_flight = JoinSet::new();
    loop {
        select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                let is_request = message.id.is_some();
                let post = post_message(
                    client.clone(),
                    endpoint.clone(),
                    message,
                    Arc::clone(&shared),
                );
                if is_request {
                    in_flight.spawn(post.in_current_span());
                } else {
                    post.await;
                }
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }
    while in_flight.join_next().await.is_some() {}
}

async fn post_message(
    client: Client,
    endpoint: Url,
    message: Outbound,
    shared: Arc<Shared>,
) {
    let result = client
        .post(endpoint)
        .header(header::CONTENT_TYPE, "application/json")
        .body(message.body)
        .send()
        .await
        .and_then(|resp| resp.error_for_status());
    if let Err(err) = result {
        warn!("failed to post a message: {err}");
        if let Some(id) = message.id {
            shared.abandon(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_endpoint() {
        let base = Url::parse("http://localhost:8000/sse").unwrap();
        let endpoint = resolve_endpoint(&base, "/messages/?session_id=abc").unwrap();
        assert_eq!(
            endpoint.as_str(),
            "http://localhost:8000/messages/?session_id=abc"
        );

        let endpoint =
            resolve_endpoint(&base, "http://127.0.0.1:9000/post").unwrap();
        assert_eq!(endpoint.as_str(), "http://127.0.0.1:9000/post");
    }
}
