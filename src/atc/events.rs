//! Websocket connection to a build's event stream.

use futures::StreamExt;
use futures::future;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use super::AtcClient;
use super::error::{AtcError, Operation};
use crate::orchestrator::{EventFeed, SubmittedBuild};

pub(super) async fn connect(
    client: &AtcClient,
    build: &SubmittedBuild,
) -> Result<EventFeed<AtcError>, AtcError> {
    let url = websocket_url(&client.endpoint(&format!("/api/v1/builds/{}/events", build.id)))?;
    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = &build.affinity {
        let value = HeaderValue::from_str(token.as_header_value()).map_err(|err| {
            AtcError::Decode {
                operation: Operation::Events,
                message: format!("invalid affinity cookie: {err}"),
            }
        })?;
        request.headers_mut().insert(COOKIE, value);
    }

    let (socket, _response) = connect_async(request).await?;
    debug!(build = build.id, "event stream connected");

    let frames = socket.filter_map(|message| future::ready(frame_text(message)));
    Ok(Box::pin(frames))
}

/// Rewrites an `http(s)` URL to the matching `ws(s)` scheme.
pub(crate) fn websocket_url(http_url: &str) -> Result<String, AtcError> {
    let mut url = reqwest::Url::parse(http_url).map_err(|err| AtcError::Config(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(AtcError::Config(format!("unsupported URL scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| AtcError::Config(format!("cannot use scheme '{scheme}' for {http_url}")))?;
    Ok(url.into())
}

fn frame_text(message: Result<Message, tungstenite::Error>) -> Option<Result<String, AtcError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text)),
        Ok(Message::Binary(bytes)) => Some(String::from_utf8(bytes).map_err(|err| {
            AtcError::Decode {
                operation: Operation::Events,
                message: err.to_string(),
            }
        })),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_) | Message::Close(_)) => None,
        Err(err) => Some(Err(err.into())),
    }
}
