//! Response handling shared by the HTTP backends.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{ControlError, ControlResult};

/// Request timeout for backend API calls.
pub(super) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a client with default headers.
pub(super) fn client(headers: HeaderMap, accept_invalid_certs: bool) -> ControlResult<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .default_headers(headers)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .map_err(ControlError::Http)
}

/// Turn a non-success status into [`ControlError::Remote`].
pub(super) async fn check(response: Response) -> ControlResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ControlError::Remote {
        status: status.as_u16(),
        message: message.trim().to_owned(),
    })
}

/// Decode a successful JSON response.
pub(super) async fn json<T: DeserializeOwned>(response: Response) -> ControlResult<T> {
    check(response).await?.json().await.map_err(ControlError::Http)
}

/// Decode a JSON response, mapping 404 to `None`.
pub(super) async fn optional_json<T: DeserializeOwned>(
    response: Response,
) -> ControlResult<Option<T>> {
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    json(response).await.map(Some)
}

/// Check a delete response, mapping 404 to [`ControlError::AlreadyAbsent`].
pub(super) async fn deleted(response: Response, what: &str) -> ControlResult<()> {
    if response.status() == StatusCode::NOT_FOUND {
        return Err(ControlError::already_absent(what.to_owned()));
    }
    check(response).await.map(|_| ())
}

/// Whether an error is a remote rejection with this status.
pub(super) fn is_status(err: &ControlError, status: StatusCode) -> bool {
    matches!(err, ControlError::Remote { status: s, .. } if *s == status.as_u16())
}
