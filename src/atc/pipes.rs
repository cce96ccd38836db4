//! Bits channel calls: allocate a pipe and stream an archive into it.

use reqwest::Body;
use tracing::{debug, info};

use super::AtcClient;
use super::error::{AtcError, Operation, ensure_success};
use crate::archive::ArchiveStream;
use crate::orchestrator::Channel;

const PIPES_PATH: &str = "/api/v1/pipes";

pub(super) async fn open_channel(client: &AtcClient) -> Result<Channel, AtcError> {
    let operation = Operation::OpenChannel;
    let response = client
        .http
        .post(client.endpoint(PIPES_PATH))
        .timeout(client.request_timeout)
        .send()
        .await
        .map_err(|source| AtcError::Http { operation, source })?;
    let response = ensure_success(operation, response).await?;
    let channel: Channel = response
        .json()
        .await
        .map_err(|source| AtcError::Http { operation, source })?;

    info!(channel = %channel.id, peer = %channel.peer_addr, "opened bits channel");
    Ok(channel)
}

// No timeout: the peer only starts reading once the backend schedules the
// build, which can take arbitrarily long.
pub(super) async fn upload(
    client: &AtcClient,
    channel: &Channel,
    archive: ArchiveStream,
) -> Result<(), AtcError> {
    let operation = Operation::Upload;
    debug!(channel = %channel.id, "uploading bits");
    let response = client
        .http
        .put(client.endpoint(&format!("{PIPES_PATH}/{}", channel.id)))
        .body(Body::wrap_stream(archive))
        .send()
        .await
        .map_err(|source| AtcError::Http { operation, source })?;
    ensure_success(operation, response).await?;

    info!(channel = %channel.id, "bits uploaded");
    Ok(())
}
