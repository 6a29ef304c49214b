//! Streaming chat transport.
//!
//! One turn is a `POST /chat/stream` whose response body is open-ended UTF-8
//! text without framing. The body is read until the server closes it, until it
//! stays silent for `max_empty_reads` consecutive idle windows, or until no
//! data has arrived for the whole turn timeout. Transient failures resubmit the whole turn with the
//! same message and history.

use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use reqwest::{Client, Response, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{ChatError, detail_from_body};
use crate::session::Session;
use crate::state::{ChatMessage, ChatRequest};

/// Shown in the transcript before a turn is resubmitted.
pub const RECONNECT_NOTICE: &str = "[connection interrupted, retrying...]";

/// What a running turn reports back to its owner, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Text read from the response body.
    Fragment(String),
    /// The turn failed transiently and is about to be resubmitted.
    Reconnecting { attempt: u32, notice: String },
    /// Always the last event of a turn.
    Finished(Result<StreamEnd, ChatError>),
}

/// Why a successful stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server closed the body.
    Closed,
    /// The body stayed silent for the configured number of idle windows.
    IdleWindowsExhausted,
    /// No data arrived for the whole turn timeout.
    TurnTimeout,
}

#[derive(Clone)]
pub struct ChatTransport {
    client: Client,
    config: TransportConfig,
    session: Session,
}

impl ChatTransport {
    pub fn new(config: TransportConfig, session: Session) -> Self {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            config,
            session,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/stream", self.config.base_url.trim_end_matches('/'))
    }

    /// Runs one turn on a background task.
    ///
    /// Dropping the returned handle cancels the turn.
    pub fn spawn_turn(&self, message: String, history: Vec<ChatMessage>) -> TurnHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let transport = self.clone();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let result = transport
                .stream_turn(&message, &history, &tx, &task_cancel)
                .await;
            let _ = tx.send(TurnEvent::Finished(result));
        });

        TurnHandle {
            events: rx,
            _guard: cancel.clone().drop_guard(),
            cancel,
            task,
        }
    }

    /// Sends `message` with `history`, forwarding fragments to `events` as
    /// they are read, and retrying transient failures per the retry policy.
    pub async fn stream_turn(
        &self,
        message: &str,
        history: &[ChatMessage],
        events: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, ChatError> {
        if message.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let Some(auth_header) = self.session.auth_header() else {
            warn!("chat turn rejected locally: no login token");
            return Err(ChatError::Unauthenticated);
        };

        let policy = &self.config.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            let error = match self
                .attempt_turn(&auth_header, message, history, events, cancel)
                .await
            {
                Ok(end) => return Ok(end),
                Err(ChatError::SessionExpired) => {
                    warn!(attempt, "chat token rejected; clearing session");
                    self.session.clear();
                    return Err(ChatError::SessionExpired);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if attempt > policy.retry_count {
                warn!(attempt, error = %error, "chat turn failed; no retries left");
                return Err(ChatError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = error.retry_delay(policy);
            warn!(attempt, wait = ?delay, error = %error, "chat turn failed; retrying");
            let _ = events.send(TurnEvent::Reconnecting {
                attempt,
                notice: RECONNECT_NOTICE.to_string(),
            });
            wait_with_cancel(cancel, delay).await?;
        }
    }

    async fn attempt_turn(
        &self,
        auth_header: &str,
        message: &str,
        history: &[ChatMessage],
        events: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, ChatError> {
        let request_id = request_id();
        debug!(request_id = %request_id, history = history.len(), "sending chat request");

        let send = self
            .client
            .post(self.chat_url())
            .header(AUTHORIZATION, auth_header)
            .header(ACCEPT, "text/plain")
            .header(CACHE_CONTROL, "no-cache")
            .header("X-Request-ID", &request_id)
            .json(&ChatRequest {
                content: message,
                history,
            })
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            result = tokio::time::timeout(self.config.response_timeout, send) => match result {
                Ok(result) => result.map_err(classify_send_error)?,
                Err(_) => {
                    return Err(ChatError::Timeout(format!(
                        "no response within {:?}",
                        self.config.response_timeout
                    )));
                }
            },
        };

        let status = response.status();
        info!(request_id = %request_id, status = status.as_u16(), "chat response received");
        if !status.is_success() {
            return Err(status_error(status, response).await);
        }

        ReadLoop::new(&self.config, &request_id)
            .run(response.bytes_stream(), events, cancel)
            .await
    }
}

/// Owner's side of a running turn.
pub struct TurnHandle {
    events: mpsc::UnboundedReceiver<TurnEvent>,
    cancel: CancellationToken,
    _guard: DropGuard,
    task: JoinHandle<()>,
}

impl TurnHandle {
    /// Next event, or `None` once the turn task is gone.
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<TurnEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn classify_send_error(err: reqwest::Error) -> ChatError {
    if err.is_timeout() {
        ChatError::Timeout(err.to_string())
    } else {
        ChatError::Transport(err.to_string())
    }
}

async fn status_error(status: StatusCode, response: Response) -> ChatError {
    if status == StatusCode::UNAUTHORIZED {
        return ChatError::SessionExpired;
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), body = %body, "chat request rejected");
    if status.is_server_error() {
        ChatError::Server {
            status: status.as_u16(),
            body,
        }
    } else {
        ChatError::Client {
            status: status.as_u16(),
            message: detail_from_body(&body)
                .unwrap_or_else(|| format!("chat request failed: {}", status.as_u16())),
        }
    }
}

async fn wait_with_cancel(cancel: &CancellationToken, duration: Duration) -> Result<(), ChatError> {
    if duration.is_zero() {
        return Ok(());
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(ChatError::Cancelled),
    }
}

/// Short hex id tying the log lines of one attempt together.
fn request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{:08x}", millis & 0xFFFF_FFFF)
}

/// End-of-stream detection for an unframed body.
///
/// The backend gives no sentinel for the end of a reply, so the loop relies on
/// connection close, an idle-window counter and the overall turn timeout.
struct ReadLoop<'a> {
    config: &'a TransportConfig,
    request_id: &'a str,
    decoder: Utf8Decoder,
    batch: String,
    batch_chars: usize,
    chars: usize,
    bytes: usize,
}

impl<'a> ReadLoop<'a> {
    fn new(config: &'a TransportConfig, request_id: &'a str) -> Self {
        Self {
            config,
            request_id,
            decoder: Utf8Decoder::default(),
            batch: String::new(),
            batch_chars: 0,
            chars: 0,
            bytes: 0,
        }
    }

    async fn run<S, B, E>(
        mut self,
        stream: S,
        events: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, ChatError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let mut stream = std::pin::pin!(stream);
        let mut deadline = Instant::now() + self.config.turn_timeout;
        let mut empty_reads: u32 = 0;
        let mut text = String::new();

        let end = loop {
            let now = Instant::now();
            if now >= deadline {
                break StreamEnd::TurnTimeout;
            }
            let window_end = deadline.min(now + self.config.idle_timeout);

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                next = tokio::time::timeout_at(window_end, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    if Instant::now() >= deadline {
                        break StreamEnd::TurnTimeout;
                    }
                    empty_reads += 1;
                    debug!(request_id = self.request_id, empty_reads, "no data within idle window");
                    if empty_reads >= self.config.max_empty_reads {
                        break StreamEnd::IdleWindowsExhausted;
                    }
                }
                Ok(None) => break StreamEnd::Closed,
                Ok(Some(Err(err))) => {
                    warn!(request_id = self.request_id, chars = self.chars, error = %err, "chat stream read failed");
                    return Err(ChatError::TransientIo(err.to_string()));
                }
                Ok(Some(Ok(chunk))) => {
                    let chunk = chunk.as_ref();
                    if chunk.is_empty() {
                        continue;
                    }
                    empty_reads = 0;
                    deadline = Instant::now() + self.config.turn_timeout;
                    self.bytes += chunk.len();
                    text.clear();
                    self.decoder.decode(chunk, &mut text);
                    self.push_text(&text, events);
                }
            }
        };

        text.clear();
        self.decoder.finish(&mut text);
        self.push_text(&text, events);
        self.flush(events);

        if self.bytes == 0 {
            warn!(request_id = self.request_id, reason = ?end, "chat stream ended without any data");
            return Err(ChatError::EmptyBody);
        }
        info!(request_id = self.request_id, chars = self.chars, reason = ?end, "chat stream finished");
        Ok(end)
    }

    fn push_text(&mut self, text: &str, events: &mpsc::UnboundedSender<TurnEvent>) {
        let batch_size = self.config.fragment_batch.max(1);
        for ch in text.chars() {
            self.chars += 1;
            self.batch.push(ch);
            self.batch_chars += 1;
            if self.batch_chars >= batch_size || ch == '\n' {
                self.flush(events);
            }
        }
    }

    fn flush(&mut self, events: &mpsc::UnboundedSender<TurnEvent>) {
        if self.batch.is_empty() {
            return;
        }
        self.batch_chars = 0;
        let _ = events.send(TurnEvent::Fragment(std::mem::take(&mut self.batch)));
    }
}

/// Incremental UTF-8 decoding across chunk boundaries.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8], out: &mut String) {
        self.pending.extend_from_slice(chunk);
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..start + valid]));
                    match err.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += valid + invalid;
                        }
                        // Incomplete sequence at the end; wait for more bytes.
                        None => {
                            start += valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
    }

    fn finish(&mut self, out: &mut String) {
        if !self.pending.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::state::TokenResponse;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn test_config(base_url: &str) -> TransportConfig {
        TransportConfig {
            base_url: base_url.to_string(),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            turn_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_millis(100),
            max_empty_reads: 3,
            fragment_batch: 1,
            retry: RetryPolicy {
                retry_count: 2,
                io_delay: Duration::from_millis(10),
                server_error_delay: Duration::from_millis(20),
                timeout_delay: Duration::from_millis(30),
            },
        }
    }

    fn logged_in_session() -> Session {
        let session = Session::in_memory();
        session.save_login(
            "13800000000",
            &TokenResponse {
                access_token: "tok".to_string(),
                token_type: "Bearer".to_string(),
            },
        );
        session
    }

    async fn collect_turn(
        transport: &ChatTransport,
        message: &str,
        history: &[ChatMessage],
    ) -> (Vec<TurnEvent>, Result<StreamEnd, ChatError>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let result = transport.stream_turn(message, history, &tx, &cancel).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, result)
    }

    fn fragments_text(events: &[TurnEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Fragment(f) => Some(f.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replies with a fixed status for the first `failures` calls, then 200.
    struct FailThenSucceed {
        calls: Arc<AtomicUsize>,
        failures: usize,
        status: u16,
        body: &'static str,
    }

    impl Respond for FailThenSucceed {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                ResponseTemplate::new(self.status).set_body_string("backend unavailable")
            } else {
                ResponseTemplate::new(200).set_body_string(self.body)
            }
        }
    }

    #[tokio::test]
    async fn test_streams_characters_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(serde_json::json!({
                "content": "hello",
                "history": [{"role": "assistant", "content": "welcome"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("Hi 你好!"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ChatTransport::new(test_config(&server.uri()), logged_in_session());
        let history = vec![ChatMessage::assistant("welcome")];
        let (events, result) = collect_turn(&transport, "hello", &history).await;

        assert_eq!(result, Ok(StreamEnd::Closed));
        let fragments: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Fragment(f) => Some(f.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments, vec!["H", "i", " ", "你", "好", "!"]);
    }

    #[tokio::test]
    async fn test_batches_fragments_and_flushes_on_newline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_string("abcdefg\nhi"))
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.fragment_batch = 5;
        let transport = ChatTransport::new(config, logged_in_session());
        let (events, result) = collect_turn(&transport, "q", &[]).await;

        assert_eq!(result, Ok(StreamEnd::Closed));
        assert_eq!(
            events,
            vec![
                TurnEvent::Fragment("abcde".into()),
                TurnEvent::Fragment("fg\n".into()),
                TurnEvent::Fragment("hi".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_token_fails_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let transport = ChatTransport::new(test_config(&server.uri()), Session::in_memory());
        let (events, result) = collect_turn(&transport, "hello", &[]).await;
        assert_eq!(result, Err(ChatError::Unauthenticated));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_503_then_success_emits_one_notice() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(FailThenSucceed {
                calls: calls.clone(),
                failures: 1,
                status: 503,
                body: "OK.",
            })
            .mount(&server)
            .await;

        let transport = ChatTransport::new(test_config(&server.uri()), logged_in_session());
        let (events, result) = collect_turn(&transport, "hello", &[]).await;

        assert_eq!(result, Ok(StreamEnd::Closed));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            events,
            vec![
                TurnEvent::Reconnecting {
                    attempt: 1,
                    notice: RECONNECT_NOTICE.to_string()
                },
                TurnEvent::Fragment("O".into()),
                TurnEvent::Fragment("K".into()),
                TurnEvent::Fragment(".".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(3)
            .mount(&server)
            .await;

        let transport = ChatTransport::new(test_config(&server.uri()), logged_in_session());
        let (events, result) = collect_turn(&transport, "hello", &[]).await;

        let notices = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::Reconnecting { .. }))
            .count();
        assert_eq!(notices, 2);
        assert_eq!(
            result,
            Err(ChatError::RetriesExhausted {
                attempts: 3,
                last: Box::new(ChatError::Server {
                    status: 500,
                    body: "boom".into()
                }),
            })
        );
    }

    #[tokio::test]
    async fn test_unauthorized_clears_session_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let session = logged_in_session();
        let transport = ChatTransport::new(test_config(&server.uri()), session.clone());
        let (events, result) = collect_turn(&transport, "hello", &[]).await;

        assert_eq!(result, Err(ChatError::SessionExpired));
        assert!(events.is_empty());
        assert!(!session.is_logged_in());
        assert_eq!(session.auth_header(), None);
    }

    #[tokio::test]
    async fn test_client_error_surfaces_detail_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(
                ResponseTemplate::new(422).set_body_string(r#"{"detail":"content too long"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = ChatTransport::new(test_config(&server.uri()), logged_in_session());
        let (_, result) = collect_turn(&transport, "hello", &[]).await;
        assert_eq!(
            result,
            Err(ChatError::Client {
                status: 422,
                message: "content too long".into()
            })
        );
    }

    #[tokio::test]
    async fn test_client_error_without_body_uses_generic_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = ChatTransport::new(test_config(&server.uri()), logged_in_session());
        let (_, result) = collect_turn(&transport, "hello", &[]).await;
        assert_eq!(
            result,
            Err(ChatError::Client {
                status: 404,
                message: "chat request failed: 404".into()
            })
        );
    }

    #[tokio::test]
    async fn test_empty_body_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let transport = ChatTransport::new(test_config(&server.uri()), logged_in_session());
        let (events, result) = collect_turn(&transport, "hello", &[]).await;
        assert_eq!(result, Ok(StreamEnd::Closed));
        assert_eq!(fragments_text(&events), "ok");
        assert!(matches!(events[0], TurnEvent::Reconnecting { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = test_config(&format!("http://{addr}"));
        config.retry.retry_count = 0;
        let transport = ChatTransport::new(config, logged_in_session());
        let (events, result) = collect_turn(&transport, "hello", &[]).await;

        assert!(events.is_empty());
        match result {
            Err(ChatError::RetriesExhausted { attempts: 1, last }) => {
                assert!(matches!(*last, ChatError::Transport(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Ending {
        /// Terminating chunk, then close.
        Close,
        /// Keep the socket open without writing anything more.
        HoldOpen,
        /// Drop the socket in the middle of the body.
        Abort,
    }

    /// Answers each accepted connection, in order, with a chunked 200 that
    /// writes the given chunks and then ends as described.
    async fn raw_server(replies: Vec<(Vec<Vec<u8>>, Ending)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (chunks, ending) in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let head = "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n";
                socket.write_all(head.as_bytes()).await.unwrap();
                for chunk in chunks {
                    let framed = [
                        format!("{:x}\r\n", chunk.len()).into_bytes(),
                        chunk,
                        b"\r\n".to_vec(),
                    ]
                    .concat();
                    socket.write_all(&framed).await.unwrap();
                    socket.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                match ending {
                    Ending::Close => {
                        socket.write_all(b"0\r\n\r\n").await.unwrap();
                        socket.flush().await.unwrap();
                    }
                    Ending::HoldOpen => tokio::time::sleep(Duration::from_secs(30)).await,
                    Ending::Abort => {}
                }
            }
        });
        format!("http://{addr}")
    }

    fn bytes_of(text: &str) -> Vec<Vec<u8>> {
        text.bytes().map(|b| vec![b]).collect()
    }

    #[tokio::test]
    async fn test_silent_stream_ends_after_empty_reads() {
        let base = raw_server(vec![(vec![b"Hel".to_vec(), b"lo".to_vec()], Ending::HoldOpen)]).await;
        let transport = ChatTransport::new(test_config(&base), logged_in_session());

        let started = std::time::Instant::now();
        let (events, result) = collect_turn(&transport, "hello", &[]).await;

        assert_eq!(result, Ok(StreamEnd::IdleWindowsExhausted));
        assert_eq!(fragments_text(&events), "Hello");
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_turn_timeout_is_not_an_error() {
        let base = raw_server(vec![(vec![b"slow".to_vec()], Ending::HoldOpen)]).await;
        let mut config = test_config(&base);
        config.turn_timeout = Duration::from_millis(150);
        config.max_empty_reads = 100;
        let transport = ChatTransport::new(config, logged_in_session());

        let (events, result) = collect_turn(&transport, "hello", &[]).await;
        assert_eq!(result, Ok(StreamEnd::TurnTimeout));
        assert_eq!(fragments_text(&events), "slow");
    }

    #[tokio::test]
    async fn test_turn_timeout_restarts_with_each_chunk() {
        let text = "a steady reply that outlasts one turn timeout";
        let base = raw_server(vec![(bytes_of(text), Ending::Close)]).await;
        let mut config = test_config(&base);
        config.turn_timeout = Duration::from_millis(100);
        let transport = ChatTransport::new(config, logged_in_session());

        let started = std::time::Instant::now();
        let (events, result) = collect_turn(&transport, "hello", &[]).await;
        assert_eq!(result, Ok(StreamEnd::Closed));
        assert_eq!(fragments_text(&events), text);
        assert!(started.elapsed() > Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_silent_stream_without_data_is_empty_body() {
        let base = raw_server(vec![(Vec::new(), Ending::HoldOpen)]).await;
        let mut config = test_config(&base);
        config.retry.retry_count = 0;
        let transport = ChatTransport::new(config, logged_in_session());

        let (events, result) = collect_turn(&transport, "hello", &[]).await;
        assert!(events.is_empty());
        assert_eq!(
            result,
            Err(ChatError::RetriesExhausted {
                attempts: 1,
                last: Box::new(ChatError::EmptyBody),
            })
        );
    }

    #[tokio::test]
    async fn test_dropped_stream_is_retried() {
        let base = raw_server(vec![
            (vec![b"Par".to_vec()], Ending::Abort),
            (vec![b"Full.".to_vec()], Ending::Close),
        ])
        .await;
        let transport = ChatTransport::new(test_config(&base), logged_in_session());

        let (events, result) = collect_turn(&transport, "hello", &[]).await;
        assert_eq!(result, Ok(StreamEnd::Closed));
        let notice = events
            .iter()
            .position(|e| matches!(e, TurnEvent::Reconnecting { attempt: 1, .. }))
            .expect("reconnect notice");
        assert_eq!(fragments_text(&events[..notice]), "Par");
        assert_eq!(fragments_text(&events[notice + 1..]), "Full.");
    }

    #[tokio::test]
    async fn test_dropped_stream_is_transient_io() {
        let base = raw_server(vec![(vec![b"Par".to_vec()], Ending::Abort)]).await;
        let mut config = test_config(&base);
        config.retry.retry_count = 0;
        let transport = ChatTransport::new(config, logged_in_session());

        let (_, result) = collect_turn(&transport, "hello", &[]).await;
        match result {
            Err(ChatError::RetriesExhausted { attempts: 1, last }) => {
                assert!(matches!(*last, ChatError::TransientIo(_)), "{last:?}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    /// Accepts connections and never answers them.
    async fn mute_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_no_response_is_timeout_with_longer_backoff() {
        let base = mute_server().await;
        let mut config = test_config(&base);
        config.response_timeout = Duration::from_millis(50);
        config.retry.retry_count = 1;
        config.retry.io_delay = Duration::from_millis(1);
        config.retry.timeout_delay = Duration::from_millis(300);
        let transport = ChatTransport::new(config, logged_in_session());

        let started = std::time::Instant::now();
        let (events, result) = collect_turn(&transport, "hello", &[]).await;

        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(matches!(events[..], [TurnEvent::Reconnecting { attempt: 1, .. }]));
        match result {
            Err(ChatError::RetriesExhausted { attempts: 2, last }) => {
                assert!(matches!(*last, ChatError::Timeout(_)), "{last:?}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_timeout_is_classified_as_timeout() {
        let base = mute_server().await;
        let client = Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let err = client.get(&base).send().await.unwrap_err();

        assert!(matches!(classify_send_error(err), ChatError::Timeout(_)));
        let policy = RetryPolicy::default();
        assert_eq!(
            ChatError::Timeout(String::new()).retry_delay(&policy),
            policy.timeout_delay
        );
    }

    #[tokio::test]
    async fn test_split_code_point_is_reassembled() {
        let snowman = "☃".as_bytes();
        let chunks = vec![
            b"a".to_vec(),
            snowman[..1].to_vec(),
            snowman[1..].to_vec(),
            b"b".to_vec(),
        ];
        let base = raw_server(vec![(chunks, Ending::Close)]).await;
        let transport = ChatTransport::new(test_config(&base), logged_in_session());

        let (events, result) = collect_turn(&transport, "hello", &[]).await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(fragments_text(&events), "a☃b");
    }

    #[tokio::test]
    async fn test_spawned_turn_ends_with_finished_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let transport = ChatTransport::new(test_config(&server.uri()), logged_in_session());
        let mut handle = transport.spawn_turn("hello".into(), Vec::new());
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        assert_eq!(
            events.last(),
            Some(&TurnEvent::Finished(Ok(StreamEnd::Closed)))
        );
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.retry.server_error_delay = Duration::from_secs(30);
        let transport = ChatTransport::new(config, logged_in_session());
        let mut handle = transport.spawn_turn("hello".into(), Vec::new());

        let first = handle.next_event().await;
        assert!(matches!(first, Some(TurnEvent::Reconnecting { .. })));
        handle.cancel();
        let last = handle.next_event().await;
        assert_eq!(last, Some(TurnEvent::Finished(Err(ChatError::Cancelled))));
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        let mut out = String::new();
        decoder.decode(&[b'a', 0xFF, b'b'], &mut out);
        decoder.finish(&mut out);
        assert_eq!(out, "a\u{FFFD}b");
    }

    #[test]
    fn test_decoder_holds_incomplete_tail() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "é".as_bytes();
        let mut out = String::new();
        decoder.decode(&bytes[..1], &mut out);
        assert_eq!(out, "");
        decoder.decode(&bytes[1..], &mut out);
        assert_eq!(out, "é");
    }
}
