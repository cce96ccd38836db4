//! Build creation and abort calls.

use reqwest::RequestBuilder;
use reqwest::header::{COOKIE, SET_COOKIE};
use serde::Deserialize;
use tracing::{debug, info};

use super::AtcClient;
use super::error::{AtcError, Operation, ensure_success};
use crate::build_spec::BuildSpec;
use crate::orchestrator::{AffinityToken, SubmittedBuild};

const BUILDS_PATH: &str = "/api/v1/builds";

#[derive(Deserialize)]
struct CreatedBuild {
    id: u64,
}

pub(super) async fn submit(client: &AtcClient, spec: &BuildSpec) -> Result<SubmittedBuild, AtcError> {
    let operation = Operation::Submit;
    let response = client
        .http
        .post(client.endpoint(BUILDS_PATH))
        .timeout(client.request_timeout)
        .json(spec)
        .send()
        .await
        .map_err(|source| AtcError::Http { operation, source })?;
    let response = ensure_success(operation, response).await?;

    let affinity = AffinityToken::from_set_cookie(
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok()),
    );
    let created: CreatedBuild = response
        .json()
        .await
        .map_err(|source| AtcError::Http { operation, source })?;

    info!(
        build = created.id,
        sticky = affinity.is_some(),
        "build created"
    );
    Ok(SubmittedBuild {
        id: created.id,
        affinity,
    })
}

pub(super) async fn abort(client: &AtcClient, build: &SubmittedBuild) -> Result<(), AtcError> {
    let operation = Operation::Abort;
    let request = client
        .http
        .post(client.endpoint(&format!("{BUILDS_PATH}/{}/abort", build.id)))
        .timeout(client.request_timeout);
    let response = with_affinity(request, build)
        .send()
        .await
        .map_err(|source| AtcError::Http { operation, source })?;
    ensure_success(operation, response).await?;

    debug!(build = build.id, "abort accepted");
    Ok(())
}

fn with_affinity(request: RequestBuilder, build: &SubmittedBuild) -> RequestBuilder {
    match &build.affinity {
        Some(token) => request.header(COOKIE, token.as_header_value()),
        None => request,
    }
}
