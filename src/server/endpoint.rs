//! Cache endpoint handlers
//!
//! `POST /projects/{project_id}/cache/{hash}` streams the body into the
//! object store, then records it in the index. `GET` on the same path
//! counts the download in the index first and only then opens the object.
//! Every failure answers 404 `{ok:false,id}`, including paths that do not
//! decode and methods other than GET and POST; the client only ever cares
//! whether it got a 200.

use std::io;

use axum::body::Body;
use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::TryStreamExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

use super::AppState;
use crate::index::{IndexError, NewArtifact};
use crate::protocol::{
    CacheResponse, ARCHIVE_CONTENT_TYPE, PROJECT_NAME_HEADER, START_TIME_HEADER, TARGET_HEADER,
};
use crate::store::{ObjectKey, PutOptions, StoreError};
use crate::types::Provenance;

/// Why a request did not succeed
#[derive(Debug, thiserror::Error)]
enum EndpointError {
    #[error("Invalid project id or hash")]
    InvalidKey,

    #[error("Undecodable path: {0}")]
    BadPath(#[source] PathRejection),

    #[error("Unsupported method")]
    UnsupportedMethod,

    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Artifact not recorded")]
    NotFound,

    #[error("Recorded artifact has no stored object")]
    Orphan,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl EndpointError {
    /// Expected outcomes that say nothing about server health
    fn is_expected(&self) -> bool {
        matches!(
            self,
            EndpointError::InvalidKey
                | EndpointError::BadPath(_)
                | EndpointError::UnsupportedMethod
                | EndpointError::UnknownProject(_)
                | EndpointError::NotFound
        )
    }
}

fn reply(status: StatusCode, body: CacheResponse) -> Response {
    (status, Json(body)).into_response()
}

fn failure(method: &str, project_id: &str, hash: &str, error: EndpointError) -> Response {
    if error.is_expected() {
        debug!(method = method, project_id = project_id, hash = hash, error = %error, "Cache request failed");
    } else {
        warn!(method = method, project_id = project_id, hash = hash, error = %error, "Cache request failed");
    }
    reply(StatusCode::NOT_FOUND, CacheResponse::failed(hash))
}

/// Project id and hash as they appear in the raw request path
///
/// Used when the path could not be extracted; segments that do not decode
/// are kept percent-encoded.
fn raw_segments(uri: &Uri) -> (String, String) {
    let decode = |segment: &str| {
        urlencoding::decode(segment)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| segment.to_string())
    };
    let mut segments = uri.path().rsplit('/');
    let hash = segments.next().map(decode).unwrap_or_default();
    let project_id = segments.nth(1).map(decode).unwrap_or_default();
    (project_id, hash)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Store an artifact
pub async fn store_artifact(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let (project_id, hash) = match path {
        Ok(Path(segments)) => segments,
        Err(rejection) => {
            let (project_id, hash) = raw_segments(&uri);
            return failure("POST", &project_id, &hash, EndpointError::BadPath(rejection));
        }
    };
    match store(&state, &project_id, &hash, &headers, body).await {
        Ok(()) => reply(StatusCode::OK, CacheResponse::ok(hash)),
        Err(e) => failure("POST", &project_id, &hash, e),
    }
}

async fn store(
    state: &AppState,
    project_id: &str,
    hash: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<(), EndpointError> {
    let key = ObjectKey::new(project_id, hash).map_err(|_| EndpointError::InvalidKey)?;
    if !state.projects.exists(&state.index, project_id).await? {
        return Err(EndpointError::UnknownProject(project_id.to_string()));
    }

    // Recorded artifacts are immutable: the bytes on disk stay the ones the record describes
    if state.index.get(project_id, hash).await?.is_some() {
        let drained = body
            .into_data_stream()
            .try_for_each(|_| futures::future::ready(Ok(())))
            .await;
        if let Err(e) = drained {
            debug!(key = %key, error = %e, "Upload of recorded artifact ended early");
        }
        debug!(key = %key, "Artifact already recorded, upload ignored");
        return Ok(());
    }

    let provenance = Provenance::from_header_values(
        header_str(headers, PROJECT_NAME_HEADER),
        header_str(headers, TARGET_HEADER),
        header_str(headers, START_TIME_HEADER),
    );
    let declared_length =
        header_str(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse::<u64>().ok());
    let options = PutOptions {
        content_type: header_str(headers, CONTENT_TYPE.as_str())
            .unwrap_or(ARCHIVE_CONTENT_TYPE)
            .to_string(),
        expires_at: Some(Utc::now() + state.object_ttl),
    };

    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let meta = state.store.put(&key, Box::pin(reader), options).await?;

    if let Some(declared) = declared_length {
        if declared != meta.content_length {
            warn!(
                key = %key,
                declared = declared,
                measured = meta.content_length,
                "Declared content length differs from stored size"
            );
        }
    }

    let artifact = NewArtifact {
        project_id: project_id.to_string(),
        hash: hash.to_string(),
        size: i64::try_from(meta.content_length).unwrap_or(i64::MAX),
        provenance,
        expires_at: meta.expires_at,
    };

    match state.index.insert(&artifact).await {
        Ok(record) => {
            debug!(key = %key, size = record.size, "Stored artifact");
            Ok(())
        }
        Err(IndexError::Duplicate { .. }) => {
            debug!(key = %key, "Artifact already recorded");
            Ok(())
        }
        Err(e) => {
            discard_unrecorded(state, &key).await;
            Err(e.into())
        }
    }
}

/// Remove an object whose record could not be written
///
/// Kept if a record turns out to exist after all, so a served artifact
/// never loses its bytes.
async fn discard_unrecorded(state: &AppState, key: &ObjectKey) {
    match state.index.get(key.project_id(), key.hash()).await {
        Ok(None) => {
            if let Err(e) = state.store.delete(key).await {
                warn!(key = %key, error = %e, "Failed to remove unrecorded object");
            }
        }
        Ok(Some(_)) => {}
        Err(e) => warn!(key = %key, error = %e, "Could not check record of unrecorded object"),
    }
}

/// Serve an artifact
pub async fn fetch_artifact(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
    uri: Uri,
) -> Response {
    let (project_id, hash) = match path {
        Ok(Path(segments)) => segments,
        Err(rejection) => {
            let (project_id, hash) = raw_segments(&uri);
            return failure("GET", &project_id, &hash, EndpointError::BadPath(rejection));
        }
    };
    match fetch(&state, &project_id, &hash).await {
        Ok(response) => response,
        Err(e) => failure("GET", &project_id, &hash, e),
    }
}

/// Answer any other method on the cache path
pub async fn unsupported_method(method: Method, uri: Uri) -> Response {
    let (project_id, hash) = raw_segments(&uri);
    failure(method.as_str(), &project_id, &hash, EndpointError::UnsupportedMethod)
}

async fn fetch(state: &AppState, project_id: &str, hash: &str) -> Result<Response, EndpointError> {
    let key = ObjectKey::new(project_id, hash).map_err(|_| EndpointError::InvalidKey)?;

    // The index decides whether the artifact exists; storage is only asked afterwards
    let pending = state
        .index
        .increment_download_and_fetch(project_id, hash)
        .await?
        .ok_or(EndpointError::NotFound)?;

    let object = match state.store.get(&key).await {
        Ok(Some(object)) => object,
        Ok(None) => {
            if let Err(e) = pending.abandon().await {
                warn!(key = %key, error = %e, "Failed to roll back download count");
            }
            return Err(EndpointError::Orphan);
        }
        Err(e) => {
            if let Err(rollback) = pending.abandon().await {
                warn!(key = %key, error = %rollback, "Failed to roll back download count");
            }
            return Err(e.into());
        }
    };

    let record = pending.commit().await?;
    debug!(
        key = %key,
        size = object.meta.content_length,
        downloads = record.downloads,
        "Serving artifact"
    );

    let content_type = HeaderValue::from_str(&object.meta.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(ARCHIVE_CONTENT_TYPE));
    let headers = [
        (CONTENT_TYPE, content_type),
        (CONTENT_LENGTH, HeaderValue::from(object.meta.content_length)),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(object.body))).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_segments() {
        let uri: Uri = "/projects/p1/cache/abc123".parse().unwrap();
        assert_eq!(raw_segments(&uri), ("p1".to_string(), "abc123".to_string()));

        let uri: Uri = "/projects/p%201/cache/%FF%FE".parse().unwrap();
        assert_eq!(raw_segments(&uri), ("p 1".to_string(), "%FF%FE".to_string()));
    }
}
