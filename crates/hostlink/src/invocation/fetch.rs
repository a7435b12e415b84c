//! Outbound HTTP(S) proxied on a worker's behalf.
//!
//! The request body drains from an inbound stream the worker opened beforehand.
//! The response head is answered as soon as upstream headers arrive; the body then
//! streams back as chunk frames on a fresh stream id.
//!
//! The idle timeout bounds the wait for the response head and then every wait
//! for the next response chunk. Upstream only answers once it has read the
//! request, so the head wait also caps the whole upload.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::InvocationController;
use crate::bridge::protocol::{FetchRequest, FetchResponse, KeyValues, PeerAddress};
use crate::connection::ConnectionRecord;
use crate::session::ResponseError;
use crate::stream::{BodySource, StreamError, StreamSink, pipe};

fn header_pairs(headers: &reqwest::header::HeaderMap) -> KeyValues {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Upstream body with every chunk wait bounded by `idle`.
fn idle_limited(response: reqwest::Response, idle: Duration) -> BodySource {
    let body = Box::pin(response.bytes_stream());
    futures::stream::unfold(Some(body), move |body| async move {
        let mut body = body?;
        match tokio::time::timeout(idle, body.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok::<Bytes, StreamError>(chunk), Some(body))),
            Ok(Some(Err(e))) => Some((Err(StreamError::Upstream(e.to_string())), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(StreamError::Upstream("upstream socket idle timeout".to_string())),
                None,
            )),
        }
    })
    .boxed()
}

/// Validate the request, take its body stream and start tracking the fetch.
fn prepare(
    controller: &InvocationController,
    record: &ConnectionRecord,
    request: &FetchRequest,
) -> Result<(reqwest::Method, reqwest::RequestBuilder, CancellationToken), ResponseError> {
    let state = record.state();
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| ResponseError::client_error(format!("invalid method {:?}", request.method)))?;
    let url = reqwest::Url::parse(&request.url)
        .map_err(|e| ResponseError::client_error(format!("invalid url {:?}: {e}", request.url)))?;
    let body = match request.stream_id {
        Some(stream_id) => Some(state.inbound().claim(stream_id).ok_or_else(|| {
            ResponseError::client_error(format!("request body stream {stream_id} is not open"))
        })?),
        None => None,
    };
    let cancel = state.track_fetch(request.request_id)?;

    let mut builder = controller.client.request(method.clone(), url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = body {
        builder = builder.body(reqwest::Body::wrap_stream(body));
    }
    Ok((method, builder, cancel))
}

pub(crate) async fn proxy(
    controller: &InvocationController,
    record: &Arc<ConnectionRecord>,
    request: FetchRequest,
) -> Result<FetchResponse, ResponseError> {
    let state = record.state();
    let fetch_id = request.request_id;
    // Nothing reads the request body once the fetch fails before its head.
    let drop_body = || {
        if let Some(stream_id) = request.stream_id {
            state.inbound().destroy(stream_id, StreamError::PeerClosed);
        }
    };

    let (method, builder, cancel) = match prepare(controller, record, &request) {
        Ok(prepared) => prepared,
        Err(e) => {
            drop_body();
            return Err(e);
        }
    };

    let idle = controller.fetch_idle_timeout;
    let sent = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ResponseError::cancelled(format!("fetch {fetch_id} aborted"))),
        sent = tokio::time::timeout(idle, builder.send()) => match sent {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ResponseError::internal(format!("fetch {fetch_id} failed: {e}"))),
            Err(_) => Err(ResponseError::new(
                crate::bridge::protocol::ResultCode::Timeout,
                format!("fetch {fetch_id} upstream socket idle timeout"),
            )),
        },
    };
    let response = match sent {
        Ok(response) => response,
        Err(e) => {
            state.untrack_fetch(fetch_id);
            drop_body();
            tracing::debug!(credential = %record.credential(), fetch_id, error = %e, "Fetch failed before response head");
            return Err(e);
        }
    };

    let session = record.session().clone();
    let stream_id = session.next_stream_id();
    let head = FetchResponse {
        status: response.status().as_u16(),
        headers: header_pairs(response.headers()),
        peer: response.remote_addr().map(PeerAddress::from),
        stream_id,
    };
    tracing::debug!(
        credential = %record.credential(),
        fetch_id,
        %method,
        status = head.status,
        stream_id,
        "Fetch response head"
    );

    let sink = StreamSink::new(session, stream_id, controller.timeouts.stream);
    let source = idle_limited(response, idle);
    let record = Arc::clone(record);
    tokio::spawn(async move {
        match pipe(source, sink, cancel).await {
            Ok(()) => tracing::trace!(fetch_id, stream_id, "Fetch body complete"),
            Err(e) if e.is_peer_closed() => {
                tracing::debug!(fetch_id, stream_id, "Fetch body abandoned");
            }
            Err(e) => tracing::debug!(fetch_id, stream_id, error = %e, "Fetch body failed"),
        }
        record.state().untrack_fetch(fetch_id);
    });

    Ok(head)
}
