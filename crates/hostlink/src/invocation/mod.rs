//! Streaming invocation controller.
//!
//! Serves the requests a bound worker sends to the host (stream, resource, fetch
//! and adaptor calls) and implements `trigger`, the host's invocation into a
//! worker with streamed request and response bodies.

pub mod adaptor;
pub mod fetch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::protocol::{
    AdaptorResponse, Empty, RequestBody, RequestKind, ResourceAction, ResourcePutRequest,
    ResourcePutResponse, ResponseBody, ResponseMetadata, StreamId, StreamOpenResponse,
    TriggerMetadata, TriggerRequest,
};
use crate::config::{HostConfig, Timeouts};
use crate::connection::ConnectionRecord;
use crate::metering::{Meter, TRIGGER_COUNT, TRIGGER_DURATION};
use crate::session::{ResponseError, SessionError, expect_response};
use crate::stream::{BodySource, ByteStream, StreamError, StreamSink, pipe};

use adaptor::{RemoteAdaptor, SideChannelAdaptor, settle};

/// Trigger methods whose response never carries a body.
pub const BODILESS_TRIGGER_METHODS: &[&str] = &["init"];

/// Response head of a trigger plus its streamed body.
#[derive(Debug)]
pub struct TriggerResult {
    pub status: u16,
    pub metadata: ResponseMetadata,
    /// Stream id shared by the request and response bodies, if either exists.
    pub stream_id: Option<StreamId>,
    pub body: ByteStream,
}

pub struct InvocationController {
    timeouts: Timeouts,
    fetch_idle_timeout: Duration,
    client: reqwest::Client,
    remote: Option<Arc<dyn RemoteAdaptor>>,
    side_channels: HashMap<String, Arc<dyn SideChannelAdaptor>>,
    meter: Arc<dyn Meter>,
}

impl InvocationController {
    pub fn new(config: &HostConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.fetch_idle_timeout)
            .build()?;
        Ok(Self {
            timeouts: config.timeouts,
            fetch_idle_timeout: config.fetch_idle_timeout,
            client,
            remote: config.remote_adaptor.clone(),
            side_channels: config.side_channels.clone(),
            meter: Arc::clone(&config.meter),
        })
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Serve one request from a bound worker.
    pub async fn dispatch(
        &self,
        record: &Arc<ConnectionRecord>,
        request: RequestBody,
    ) -> Result<ResponseBody, ResponseError> {
        let kind = request.kind();
        match request {
            RequestBody::Credentials(_) => Err(ResponseError::client_error(format!(
                "session is already bound to {}",
                record.credential()
            ))),
            RequestBody::StreamOpen(Empty) => {
                let stream_id = record.session().next_stream_id();
                record.state().ensure_open()?;
                record.state().inbound().register_parked(stream_id)?;
                tracing::trace!(credential = %record.credential(), stream_id, "Opened inbound stream");
                Ok(ResponseBody::StreamOpen(StreamOpenResponse { stream_id }))
            }
            RequestBody::StreamPush(push) => {
                record.state().inbound().push(push).await?;
                Ok(ResponseBody::StreamPush(Empty))
            }
            RequestBody::ResourcePut(put) => self
                .resource_put(record, put)
                .map(ResponseBody::ResourcePut),
            RequestBody::Fetch(request) => fetch::proxy(self, record, request)
                .await
                .map(ResponseBody::Fetch),
            RequestBody::FetchAbort(abort) => {
                if !record.state().abort_fetch(abort.request_id) {
                    tracing::trace!(fetch_id = abort.request_id, "Abort for finished fetch");
                }
                Ok(ResponseBody::FetchAbort(Empty))
            }
            RequestBody::RemoteInvoke(request) => {
                let adaptor = self
                    .remote
                    .as_ref()
                    .ok_or_else(|| ResponseError::not_implemented(kind))?;
                let call = adaptor.invoke(record.credential(), request);
                self.adaptor_call(kind, self.timeouts.fetch, call)
                    .await
                    .map(ResponseBody::RemoteInvoke)
            }
            RequestBody::RemoteBinding(request) => {
                let adaptor = self
                    .remote
                    .as_ref()
                    .ok_or_else(|| ResponseError::not_implemented(kind))?;
                let call = adaptor.binding(record.credential(), request);
                self.adaptor_call(kind, self.timeouts.fetch, call)
                    .await
                    .map(ResponseBody::RemoteBinding)
            }
            RequestBody::SideChannel(request) => {
                let adaptor = self
                    .side_channels
                    .get(&request.name)
                    .ok_or_else(|| ResponseError::not_implemented(kind))?;
                let call = adaptor.call(record.credential(), request);
                self.adaptor_call(kind, self.timeouts.side_channel, call)
                    .await
                    .map(ResponseBody::SideChannel)
            }
            // Host-to-worker kinds.
            RequestBody::Trigger(_)
            | RequestBody::CollectMetrics(_)
            | RequestBody::ResourceNotification(_)
            | RequestBody::InspectorStart(_)
            | RequestBody::InspectorStartSession(_)
            | RequestBody::InspectorCommand(_)
            | RequestBody::TracingStart(_)
            | RequestBody::TracingStop(_) => Err(ResponseError::not_implemented(kind)),
        }
    }

    async fn adaptor_call<F>(
        &self,
        kind: RequestKind,
        timeout: Duration,
        call: F,
    ) -> Result<AdaptorResponse, ResponseError>
    where
        F: Future<Output = Result<AdaptorResponse, adaptor::AdaptorError>>,
    {
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => settle(kind, result),
            Err(_) => Err(ResponseError::from(SessionError::Timeout)),
        }
    }

    fn resource_put(
        &self,
        record: &ConnectionRecord,
        put: ResourcePutRequest,
    ) -> Result<ResourcePutResponse, ResponseError> {
        let state = record.state();
        let arbiter = record.arbiter();
        let exclusive = match put.action {
            ResourceAction::AcquireShared => false,
            ResourceAction::AcquireExclusive => true,
            ResourceAction::Release => {
                let token = put
                    .token
                    .ok_or_else(|| ResponseError::client_error("release requires a token"))?;
                if token.credential() != record.credential() {
                    return Err(ResponseError::client_error(format!(
                        "token {token} was not issued to {}",
                        record.credential()
                    )));
                }
                state.remove_token(&token);
                let released = arbiter.release(&put.resource_id, &token);
                return Ok(ResourcePutResponse {
                    acquired_or_released: released,
                    token,
                });
            }
        };

        state.ensure_open()?;
        let outcome = arbiter.acquire(&put.resource_id, exclusive, record.credential());
        let token = outcome.token().clone();
        if let Err(e) = state.add_token(&put.resource_id, token.clone()) {
            // Closed between the check and the grant.
            arbiter.release(&put.resource_id, &token);
            return Err(e.into());
        }
        Ok(ResourcePutResponse {
            acquired_or_released: outcome.is_acquired(),
            token,
        })
    }

    /// Invoke `method` on the worker bound to `record`.
    ///
    /// `data` is streamed to the worker unless the metadata names a bodiless HTTP
    /// method. Resolves once the response head arrives; the body keeps streaming.
    pub async fn trigger(
        &self,
        record: &Arc<ConnectionRecord>,
        method: &str,
        data: Option<BodySource>,
        metadata: TriggerMetadata,
    ) -> Result<TriggerResult, SessionError> {
        let started = Instant::now();
        let labels = [("method", method)];
        self.meter.increment(TRIGGER_COUNT, &labels, 1);

        let result = self.trigger_inner(record, method, data, metadata).await;
        self.meter
            .record_duration(TRIGGER_DURATION, &labels, started.elapsed());
        if let Err(e) = &result {
            tracing::debug!(credential = %record.credential(), method, error = %e, "Trigger failed");
        }
        result
    }

    async fn trigger_inner(
        &self,
        record: &Arc<ConnectionRecord>,
        method: &str,
        data: Option<BodySource>,
        metadata: TriggerMetadata,
    ) -> Result<TriggerResult, SessionError> {
        let session = record.session();
        let state = record.state();
        let data = data.filter(|_| !metadata.is_bodiless());
        let has_input_data = data.is_some();
        let has_output_data = !BODILESS_TRIGGER_METHODS.contains(&method)
            && !metadata
                .method
                .as_deref()
                .is_some_and(|m| m.eq_ignore_ascii_case("HEAD"));
        let stream_id = (has_input_data || has_output_data).then(|| session.next_stream_id());
        let timeout = metadata
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeouts.invoke);

        let body = match stream_id {
            Some(stream_id) if has_output_data => state
                .open_inbound(stream_id)
                .map_err(|_| SessionError::Cancelled)?,
            _ => ByteStream::empty(),
        };

        let input = match (stream_id, data) {
            (Some(stream_id), Some(data)) => {
                let cancel = match state.track_outbound(stream_id) {
                    Ok(cancel) => cancel,
                    Err(_) => {
                        state.inbound().destroy(stream_id, StreamError::PeerClosed);
                        return Err(SessionError::Cancelled);
                    }
                };
                let sink = StreamSink::new(session.clone(), stream_id, self.timeouts.stream);
                let record = Arc::clone(record);
                tokio::spawn({
                    let cancel = cancel.clone();
                    async move {
                        if let Err(e) = pipe(data, sink, cancel).await
                            && !e.is_peer_closed()
                        {
                            tracing::debug!(stream_id, error = %e, "Trigger input stream failed");
                        }
                        record.state().untrack_outbound(stream_id);
                    }
                });
                Some(cancel)
            }
            _ => None,
        };

        let request = TriggerRequest {
            method: method.to_string(),
            metadata,
            has_input_data,
            has_output_data,
            stream_id,
        };
        let response = session
            .request(RequestBody::Trigger(request), timeout)
            .await
            .and_then(|response| expect_response!(response, Trigger));

        match response {
            Ok(response) => Ok(TriggerResult {
                status: response.status,
                metadata: response.metadata,
                stream_id,
                body,
            }),
            Err(e) => {
                if let Some(stream_id) = stream_id {
                    state.inbound().destroy(stream_id, StreamError::PeerClosed);
                }
                if let Some(cancel) = input {
                    cancel.cancel();
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, OnceLock};

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use tokio::io::DuplexStream;
    use tokio_util::bytes::Bytes;
    use tokio_util::codec::Framed;

    use super::adaptor::AdaptorError;
    use super::*;
    use crate::bridge::codec::FrameCodec;
    use wiremock::matchers::method as http_method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::bridge::protocol::{
        BindingRequest, CredentialsRequest, FetchAbortRequest, FetchRequest, Message, Payload,
        RemoteInvokeRequest, ResultCode, StreamPushRequest, TriggerResponse,
    };
    use crate::metering::testing::RecordingMeter;
    use crate::resource::ResourceArbiter;
    use crate::session::{RequestHandler, Session, SessionId};

    /// Routes inbound requests of the test session into the controller.
    struct Routed {
        ctl: Arc<InvocationController>,
        record: OnceLock<Arc<ConnectionRecord>>,
    }

    #[async_trait]
    impl RequestHandler for Routed {
        async fn handle(
            &self,
            _session: &Session,
            request: RequestBody,
        ) -> Result<ResponseBody, ResponseError> {
            match self.record.get() {
                Some(record) => self.ctl.dispatch(record, request).await,
                None => Err(ResponseError::not_implemented(request.kind())),
            }
        }
    }

    struct StatusChannel;

    #[async_trait]
    impl SideChannelAdaptor for StatusChannel {
        async fn call(
            &self,
            credential: &str,
            request: BindingRequest,
        ) -> Result<AdaptorResponse, AdaptorError> {
            match request.operation.as_str() {
                "get" => Ok(AdaptorResponse {
                    status: 200,
                    data: format!("{credential}:{}", request.name).into_bytes(),
                }),
                _ => Err(AdaptorError::status(409, "conflict")),
            }
        }
    }

    fn controller(meter: Arc<RecordingMeter>) -> Arc<InvocationController> {
        let config = HostConfig::new("/unused")
            .with_meter(meter)
            .with_side_channel("kv", Arc::new(StatusChannel));
        Arc::new(InvocationController::new(&config).unwrap())
    }

    async fn open_body(
        ctl: &InvocationController,
        record: &Arc<ConnectionRecord>,
        data: &str,
    ) -> StreamId {
        let opened = ctl
            .dispatch(record, RequestBody::StreamOpen(Empty))
            .await
            .unwrap();
        let ResponseBody::StreamOpen(StreamOpenResponse { stream_id }) = opened else {
            panic!("unexpected response {opened:?}");
        };
        for push in [
            StreamPushRequest::chunk(stream_id, data.as_bytes().to_vec()),
            StreamPushRequest::end(stream_id),
        ] {
            ctl.dispatch(record, RequestBody::StreamPush(push))
                .await
                .unwrap();
        }
        stream_id
    }

    fn fetch_request(
        request_id: u32,
        verb: &str,
        url: String,
        body: Option<StreamId>,
    ) -> RequestBody {
        RequestBody::Fetch(FetchRequest {
            request_id,
            url,
            method: verb.to_string(),
            headers: Vec::new(),
            stream_id: body,
        })
    }

    fn record(
        ctl: &Arc<InvocationController>,
    ) -> (Arc<ConnectionRecord>, Framed<DuplexStream, FrameCodec>) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let handler = Arc::new(Routed {
            ctl: Arc::clone(ctl),
            record: OnceLock::new(),
        });
        let session = Session::spawn(SessionId::new(1), local, handler.clone());
        let arbiter = ResourceArbiter::new("ns", Duration::from_secs(10)).0;
        let record = Arc::new(ConnectionRecord::new("w1", session, false, arbiter));
        let _ = handler.record.set(Arc::clone(&record));
        (record, Framed::new(peer, FrameCodec::new()))
    }

    #[tokio::test]
    async fn stream_open_then_push_feeds_parked_stream() {
        let ctl = controller(Arc::default());
        let (record, _peer) = record(&ctl);

        let opened = ctl
            .dispatch(&record, RequestBody::StreamOpen(Empty))
            .await
            .unwrap();
        let ResponseBody::StreamOpen(StreamOpenResponse { stream_id }) = opened else {
            panic!("unexpected response {opened:?}");
        };
        for push in [
            StreamPushRequest::chunk(stream_id, b"abc".to_vec()),
            StreamPushRequest::end(stream_id),
        ] {
            ctl.dispatch(&record, RequestBody::StreamPush(push))
                .await
                .unwrap();
        }

        let body = record.state().inbound().claim(stream_id).unwrap();
        assert_eq!(body.read_to_end().await.unwrap(), "abc".as_bytes());
    }

    #[tokio::test]
    async fn resource_put_acquires_queues_and_releases() {
        let ctl = controller(Arc::default());
        let (record, _peer) = record(&ctl);
        let put = |action, token| {
            RequestBody::ResourcePut(ResourcePutRequest {
                resource_id: "db".to_string(),
                action,
                token,
            })
        };

        let ResponseBody::ResourcePut(first) = ctl
            .dispatch(&record, put(ResourceAction::AcquireExclusive, None))
            .await
            .unwrap()
        else {
            panic!("wrong response kind");
        };
        assert!(first.acquired_or_released);
        let ResponseBody::ResourcePut(second) = ctl
            .dispatch(&record, put(ResourceAction::AcquireShared, None))
            .await
            .unwrap()
        else {
            panic!("wrong response kind");
        };
        assert!(!second.acquired_or_released);
        assert_eq!(record.state().token_count(), 2);

        let ResponseBody::ResourcePut(released) = ctl
            .dispatch(&record, put(ResourceAction::Release, Some(first.token.clone())))
            .await
            .unwrap()
        else {
            panic!("wrong response kind");
        };
        assert!(released.acquired_or_released);
        assert!(record.state().holds(&second.token));
        assert!(!record.state().holds(&first.token));

        let err = ctl
            .dispatch(&record, put(ResourceAction::Release, None))
            .await
            .unwrap_err();
        assert_eq!(err.code, ResultCode::ClientError);
    }

    #[tokio::test]
    async fn adaptor_calls_route_by_configuration() {
        let ctl = controller(Arc::default());
        let (record, _peer) = record(&ctl);

        let err = ctl
            .dispatch(
                &record,
                RequestBody::RemoteInvoke(RemoteInvokeRequest::default()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ResultCode::NotImplemented);

        let call = |name: &str, operation: &str| {
            RequestBody::SideChannel(BindingRequest {
                name: name.to_string(),
                operation: operation.to_string(),
                ..Default::default()
            })
        };
        let ok = ctl.dispatch(&record, call("kv", "get")).await.unwrap();
        assert_eq!(
            ok,
            ResponseBody::SideChannel(AdaptorResponse {
                status: 200,
                data: b"w1:kv".to_vec(),
            })
        );
        let conflict = ctl.dispatch(&record, call("kv", "put")).await.unwrap();
        assert_eq!(
            conflict,
            ResponseBody::SideChannel(AdaptorResponse {
                status: 409,
                data: b"conflict".to_vec(),
            })
        );
        let missing = ctl.dispatch(&record, call("queue", "get")).await.unwrap_err();
        assert_eq!(missing.code, ResultCode::NotImplemented);
    }

    #[tokio::test]
    async fn second_handshake_on_bound_session_is_rejected() {
        let ctl = controller(Arc::default());
        let (record, _peer) = record(&ctl);
        let err = ctl
            .dispatch(
                &record,
                RequestBody::Credentials(CredentialsRequest {
                    credential: "w1".to_string(),
                    diagnostic: false,
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ResultCode::ClientError);
    }

    #[tokio::test]
    async fn trigger_streams_input_and_reports_metrics() {
        let meter = Arc::new(RecordingMeter::default());
        let ctl = controller(Arc::clone(&meter));
        let (record, mut peer) = record(&ctl);

        let input = futures::stream::iter([Ok(Bytes::from("ping"))]).boxed();
        let metadata = TriggerMetadata {
            method: Some("POST".to_string()),
            ..Default::default()
        };
        let call = {
            let record = Arc::clone(&record);
            tokio::spawn(async move {
                ctl.trigger(&record, "invoke", Some(input), metadata).await
            })
        };

        // Play the worker: acknowledge input chunks, answer the trigger, push output.
        let mut trigger = None;
        let mut input_done = false;
        while trigger.is_none() || !input_done {
            let msg = peer.next().await.unwrap().unwrap();
            match msg.payload {
                Payload::Request(RequestBody::Trigger(req)) => {
                    assert!(req.has_input_data && req.has_output_data);
                    trigger = Some((msg.request_id, req.stream_id.unwrap()));
                }
                Payload::Request(RequestBody::StreamPush(push)) => {
                    input_done = push.is_eos;
                    peer.send(Message::response(msg.request_id, ResponseBody::StreamPush(Empty)))
                        .await
                        .unwrap();
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        let (request_id, stream_id) = trigger.unwrap();
        peer.send(Message::response(
            request_id,
            ResponseBody::Trigger(TriggerResponse {
                status: 200,
                metadata: ResponseMetadata::default(),
            }),
        ))
        .await
        .unwrap();
        for push in [
            StreamPushRequest::chunk(stream_id, b"pong".to_vec()),
            StreamPushRequest::end(stream_id),
        ] {
            peer.send(Message::request(100 + push.is_eos as u32, RequestBody::StreamPush(push)))
                .await
                .unwrap();
        }

        let result = call.await.unwrap().unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.stream_id, Some(stream_id));
        assert_eq!(result.body.read_to_end().await.unwrap(), "pong".as_bytes());

        let counters = meter.counters.lock().unwrap().clone();
        assert_eq!(
            counters,
            [(
                TRIGGER_COUNT.to_string(),
                vec![("method".to_string(), "invoke".to_string())],
                1
            )]
        );
        assert_eq!(meter.durations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bodiless_trigger_opens_no_stream() {
        let ctl = controller(Arc::default());
        let (record, mut peer) = record(&ctl);

        let input = futures::stream::iter([Ok(Bytes::from("ignored"))]).boxed();
        let metadata = TriggerMetadata {
            method: Some("get".to_string()),
            ..Default::default()
        };
        let call = {
            let record = Arc::clone(&record);
            tokio::spawn(async move { ctl.trigger(&record, "init", Some(input), metadata).await })
        };

        let msg = peer.next().await.unwrap().unwrap();
        let Payload::Request(RequestBody::Trigger(req)) = msg.payload else {
            panic!("expected trigger, got {:?}", msg.payload);
        };
        assert!(!req.has_input_data);
        assert!(!req.has_output_data);
        assert_eq!(req.stream_id, None);
        peer.send(Message::response(
            msg.request_id,
            ResponseBody::Trigger(TriggerResponse {
                status: 204,
                ..Default::default()
            }),
        ))
        .await
        .unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result.status, 204);
        assert_eq!(result.body.read_to_end().await.unwrap(), Bytes::new());
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_timeout_cleans_up_output_stream() {
        let ctl = controller(Arc::default());
        let (record, _peer) = record(&ctl);
        let metadata = TriggerMetadata {
            timeout_ms: Some(50),
            ..Default::default()
        };

        let err = ctl
            .trigger(&record, "invoke", None, metadata)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Timeout);
        assert!(record.state().inbound().is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_releases_request_body() {
        let ctl = controller(Arc::default());
        let (record, _peer) = record(&ctl);

        for request_id in 1..=3 {
            let body = open_body(&ctl, &record, "x").await;
            let err = ctl
                .dispatch(
                    &record,
                    fetch_request(request_id, "POST", "not a url".to_string(), Some(body)),
                )
                .await
                .unwrap_err();
            assert_eq!(err.code, ResultCode::ClientError);
        }

        let body = open_body(&ctl, &record, "x").await;
        let err = ctl
            .dispatch(
                &record,
                fetch_request(4, "BAD VERB", "http://127.0.0.1:1/".to_string(), Some(body)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ResultCode::ClientError);

        let _in_flight = record.state().track_fetch(5).unwrap();
        let body = open_body(&ctl, &record, "x").await;
        let err = ctl
            .dispatch(
                &record,
                fetch_request(5, "POST", "http://127.0.0.1:1/".to_string(), Some(body)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ResultCode::ClientError);

        assert!(record.state().inbound().is_empty());
    }

    #[tokio::test]
    async fn abort_cancels_fetch_waiting_for_head() {
        let upstream = MockServer::start().await;
        Mock::given(http_method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&upstream)
            .await;

        let ctl = controller(Arc::default());
        let (record, _peer) = record(&ctl);
        let body = open_body(&ctl, &record, "payload").await;

        let fetch = tokio::spawn({
            let ctl = Arc::clone(&ctl);
            let record = Arc::clone(&record);
            let request = fetch_request(7, "POST", format!("{}/slow", upstream.uri()), Some(body));
            async move { ctl.dispatch(&record, request).await }
        });
        // An abort that lands before the fetch is tracked is a no-op; keep trying.
        while !fetch.is_finished() {
            ctl.dispatch(
                &record,
                RequestBody::FetchAbort(FetchAbortRequest { request_id: 7 }),
            )
            .await
            .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = fetch.await.unwrap().unwrap_err();
        assert_eq!(err.code, ResultCode::Cancelled);
        assert!(!record.state().abort_fetch(7));
        assert!(record.state().inbound().is_empty());
    }

    #[tokio::test]
    async fn silent_upstream_hits_idle_timeout() {
        let upstream = MockServer::start().await;
        Mock::given(http_method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&upstream)
            .await;

        let config =
            HostConfig::new("/unused").with_fetch_idle_timeout(Duration::from_millis(100));
        let ctl = Arc::new(InvocationController::new(&config).unwrap());
        let (record, _peer) = record(&ctl);

        let err = ctl
            .dispatch(&record, fetch_request(1, "GET", upstream.uri(), None))
            .await
            .unwrap_err();
        assert_eq!(err.code, ResultCode::Timeout);
        assert!(!record.state().abort_fetch(1));
    }
}
