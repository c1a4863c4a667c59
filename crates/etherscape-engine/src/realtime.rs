//! Realtime Streaming Channel: one persistent socket to the streaming
//! provider, reduced into a small observable state and a tagged event stream.

use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{client_tls_with_config, Message as WsMessage, WebSocket};

use crate::dispatch::DispatchOptions;

const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_NO_STATUS: u16 = 1005;
const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// Intermediate image; only the live preview changes.
    Progress(String),
    Done(String),
    Failed(String),
    /// Socket closed normally before the generation completed.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeUpdate {
    pub generation_id: u64,
    pub event: RealtimeEvent,
}

pub type RealtimeSink = Arc<dyn Fn(RealtimeUpdate) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeState {
    pub image_url: Option<String>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl RealtimeState {
    pub fn begin(&mut self) {
        self.is_loading = true;
        self.error = None;
    }

    /// Reduces one socket frame. `Failed` means the socket should be closed.
    pub fn apply_frame(&mut self, raw: &str) -> Option<RealtimeEvent> {
        let frame: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => return Some(self.fail(format!("Invalid realtime message: {err}"))),
        };

        if let Some(message) = frame_error(&frame) {
            return Some(self.fail(message));
        }

        let image = frame
            .get("images")
            .and_then(Value::as_array)
            .and_then(|images| images.first())
            .and_then(|image| image.get("url"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        let completed = frame
            .get("status")
            .and_then(Value::as_str)
            .map(|status| status.eq_ignore_ascii_case("COMPLETED"))
            .unwrap_or(false);

        if let Some(url) = image {
            self.image_url = Some(url.clone());
            if completed {
                self.is_loading = false;
                return Some(RealtimeEvent::Done(url));
            }
            return Some(RealtimeEvent::Progress(url));
        }
        if completed {
            return match self.image_url.clone() {
                Some(url) if self.is_loading => {
                    self.is_loading = false;
                    Some(RealtimeEvent::Done(url))
                }
                Some(_) => None,
                None => Some(self.fail("Realtime generation completed without an image".to_string())),
            };
        }
        None
    }

    /// `code` is `None` when the peer sent no close status.
    pub fn apply_close(&mut self, code: Option<u16>) -> Option<RealtimeEvent> {
        if !self.is_loading || self.error.is_some() {
            self.is_loading = false;
            return None;
        }
        let code = code.unwrap_or(CLOSE_NO_STATUS);
        if code != CLOSE_NORMAL && code != CLOSE_NO_STATUS {
            return Some(self.fail(format!(
                "Realtime connection closed unexpectedly (code {code})"
            )));
        }
        self.is_loading = false;
        Some(RealtimeEvent::Closed)
    }

    pub fn disconnect(&mut self) {
        self.is_loading = false;
    }

    fn fail(&mut self, message: String) -> RealtimeEvent {
        self.is_loading = false;
        self.error = Some(message.clone());
        RealtimeEvent::Failed(message)
    }
}

fn frame_error(frame: &Value) -> Option<String> {
    if let Some(error) = frame.get("error").filter(|value| !value.is_null()) {
        let message = match error {
            Value::String(text) => text.trim().to_string(),
            Value::Object(obj) => obj
                .get("message")
                .or_else(|| obj.get("detail"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        };
        return Some(if message.is_empty() {
            "Realtime provider reported an error".to_string()
        } else {
            message
        });
    }

    let has_images = frame.get("images").is_some();
    if !has_images {
        if let Some(message) = frame.get("message").and_then(Value::as_str) {
            return Some(message.trim().to_string());
        }
    }

    let logs = match frame.get("logs").or_else(|| frame.get("log")) {
        Some(Value::Array(rows)) => rows.iter().collect::<Vec<_>>(),
        Some(row @ Value::Object(_)) => vec![row],
        _ => Vec::new(),
    };
    logs.into_iter()
        .find(|row| {
            row.get("level")
                .and_then(Value::as_str)
                .map(|level| level.eq_ignore_ascii_case("ERROR"))
                .unwrap_or(false)
        })
        .map(|row| {
            row.get("message")
                .and_then(Value::as_str)
                .unwrap_or("Realtime provider logged an error")
                .to_string()
        })
}

/// The channel as the orchestrator sees it.
pub trait RealtimeGenerator: Send {
    /// Starts a generation and returns the id every resulting update carries.
    fn generate(&mut self, api_key: &str, model_id: &str, options: &DispatchOptions) -> Result<u64>;
    fn disconnect(&mut self);
    fn state(&self) -> RealtimeState;
}

pub struct RealtimeChannel {
    api_base: String,
    sink: RealtimeSink,
    state: Arc<Mutex<RealtimeState>>,
    next_generation_id: u64,
    /// Stop flag of the live worker. Stopped workers are detached, not joined.
    worker: Option<Arc<AtomicBool>>,
}

impl RealtimeChannel {
    pub fn new(api_base: String, sink: RealtimeSink) -> Self {
        Self {
            api_base,
            sink,
            state: Arc::new(Mutex::new(RealtimeState::default())),
            next_generation_id: 1,
            worker: None,
        }
    }

    fn stop_worker(&mut self) {
        if let Some(stop_flag) = self.worker.take() {
            stop_flag.store(true, Ordering::SeqCst);
        }
    }
}

impl RealtimeGenerator for RealtimeChannel {
    fn generate(&mut self, api_key: &str, model_id: &str, options: &DispatchOptions) -> Result<u64> {
        self.stop_worker();
        let generation_id = self.next_generation_id;
        self.next_generation_id += 1;

        let request = build_socket_request(&self.api_base, model_id, api_key)?;
        let frame = build_generation_frame(options, api_key);
        lock_state(&self.state).begin();

        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker = RealtimeWorker {
            generation_id,
            frame,
            sink: Arc::clone(&self.sink),
            state: Arc::clone(&self.state),
            stop_flag: Arc::clone(&stop_flag),
        };
        thread::Builder::new()
            .name("etherscape-realtime".to_string())
            .spawn(move || worker.run(request))
            .context("realtime thread spawn failed")?;
        self.worker = Some(stop_flag);
        Ok(generation_id)
    }

    fn disconnect(&mut self) {
        self.stop_worker();
        lock_state(&self.state).disconnect();
    }

    fn state(&self) -> RealtimeState {
        lock_state(&self.state).clone()
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn lock_state(state: &Mutex<RealtimeState>) -> MutexGuard<'_, RealtimeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct RealtimeWorker {
    generation_id: u64,
    frame: Value,
    sink: RealtimeSink,
    state: Arc<Mutex<RealtimeState>>,
    stop_flag: Arc<AtomicBool>,
}

impl RealtimeWorker {
    fn run(self, request: tungstenite::http::Request<()>) {
        let mut ws = match self.open(request) {
            Ok(ws) => ws,
            Err(err) => {
                let message = format!("Realtime connection failed: {err:#}");
                if let Some(event) = self.update(|state| Some(state.fail(message))) {
                    self.emit(event);
                }
                return;
            }
        };

        while !self.stop_flag.load(Ordering::SeqCst) {
            let message = match ws.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.closed(None);
                    return;
                }
                Err(_) => {
                    self.closed(Some(CLOSE_ABNORMAL));
                    return;
                }
            };
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }

            let raw = match message {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                WsMessage::Close(frame) => {
                    self.closed(frame.map(|frame| u16::from(frame.code)));
                    return;
                }
                _ => continue,
            };

            if let Some(event) = self.update(|state| state.apply_frame(&raw)) {
                let failed = matches!(event, RealtimeEvent::Failed(_));
                self.emit(event);
                if failed {
                    break;
                }
            }
        }

        let _ = ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        }));
        let _ = ws.flush();
    }

    fn open(&self, request: tungstenite::http::Request<()>) -> Result<WebSocket<MaybeTlsStream<TcpStream>>> {
        let stream = connect_stream(&request)?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .context("failed to set handshake timeout")?;
        stream
            .set_write_timeout(Some(HANDSHAKE_TIMEOUT))
            .context("failed to set handshake timeout")?;
        if self.stop_flag.load(Ordering::SeqCst) {
            return Err(anyhow!("realtime generation superseded"));
        }
        let (mut ws, _) = client_tls_with_config(request, stream, None, None)
            .map_err(|err| anyhow!("realtime websocket handshake failed: {err}"))?;
        let raw = serde_json::to_string(&self.frame).context("failed to serialize realtime frame")?;
        ws.send(WsMessage::Text(raw.into()))
            .context("failed to send realtime frame")?;
        set_socket_read_timeout(&mut ws, Some(SOCKET_READ_TIMEOUT));
        Ok(ws)
    }

    fn closed(&self, code: Option<u16>) {
        if let Some(event) = self.update(|state| state.apply_close(code)) {
            self.emit(event);
        }
    }

    /// Applies `reduce` only while this worker is still the live one.
    fn update<T>(&self, reduce: impl FnOnce(&mut RealtimeState) -> Option<T>) -> Option<T> {
        let mut state = lock_state(&self.state);
        if self.stop_flag.load(Ordering::SeqCst) {
            return None;
        }
        reduce(&mut state)
    }

    fn emit(&self, event: RealtimeEvent) {
        (self.sink)(RealtimeUpdate {
            generation_id: self.generation_id,
            event,
        });
    }
}

/// Opens the TCP leg with a bounded connect so a dead peer cannot pin the worker.
fn connect_stream(request: &tungstenite::http::Request<()>) -> Result<TcpStream> {
    let uri = request.uri();
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("realtime url has no host"))?
        .trim_start_matches('[')
        .trim_end_matches(']');
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("wss") => 443,
        _ => 80,
    });
    let mut last_error = None;
    for addr in (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {host}"))?
    {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    match last_error {
        Some(err) => Err(anyhow!("realtime connect to {host}:{port} failed: {err}")),
        None => Err(anyhow!("no address found for {host}")),
    }
}

fn set_socket_read_timeout(ws: &mut WebSocket<MaybeTlsStream<TcpStream>>, timeout: Option<Duration>) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

fn realtime_ws_url(api_base: &str, model_id: &str) -> String {
    let model = model_id.trim().trim_matches('/');
    let base = api_base.trim().trim_end_matches('/');
    let base = match reqwest::Url::parse(base) {
        Ok(mut url) => {
            let scheme = match url.scheme() {
                "https" => "wss".to_string(),
                "http" => "ws".to_string(),
                other => other.to_string(),
            };
            let _ = url.set_scheme(&scheme);
            url.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => base.to_string(),
    };
    format!("{base}/{model}/ws")
}

fn build_socket_request(
    api_base: &str,
    model_id: &str,
    api_key: &str,
) -> Result<tungstenite::http::Request<()>> {
    let url = realtime_ws_url(api_base, model_id);
    let mut request = url
        .as_str()
        .into_client_request()
        .context("invalid realtime websocket request")?;
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Key {}", api_key.trim()))
            .context("invalid realtime auth header")?,
    );
    Ok(request)
}

fn build_generation_frame(options: &DispatchOptions, api_key: &str) -> Value {
    json!({
        "prompt": options.prompt,
        "negative_prompt": options.negative_prompt().unwrap_or_default(),
        "seed": options.params.seed,
        "image_size": {
            "width": options.dimensions.width,
            "height": options.dimensions.height,
        },
        "num_inference_steps": options.params.steps,
        "guidance_scale": options.params.cfg_scale,
        "sync_mode": true,
        "num_images": 1,
        "key": api_key.trim(),
    })
}

#[cfg(test)]
mod tests {
    use etherscape_contracts::dimensions::Dimensions;
    use serde_json::json;

    use std::net::TcpListener;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    use super::{
        build_generation_frame, realtime_ws_url, RealtimeChannel, RealtimeEvent, RealtimeGenerator,
        RealtimeState, RealtimeUpdate,
    };
    use crate::dispatch::DispatchOptions;

    fn loading() -> RealtimeState {
        let mut state = RealtimeState::default();
        state.begin();
        state
    }

    #[test]
    fn progress_then_completed_keeps_last_image() {
        let mut state = loading();
        assert_eq!(
            state.apply_frame(r#"{"images":[{"url":"https://fal.media/1.png"}]}"#),
            Some(RealtimeEvent::Progress("https://fal.media/1.png".to_string()))
        );
        assert!(state.is_loading);
        assert_eq!(
            state.apply_frame(r#"{"status":"COMPLETED","images":[{"url":"https://fal.media/2.png"}]}"#),
            Some(RealtimeEvent::Done("https://fal.media/2.png".to_string()))
        );
        assert!(!state.is_loading);
        assert_eq!(state.image_url.as_deref(), Some("https://fal.media/2.png"));
    }

    #[test]
    fn completed_without_any_image_fails() {
        let mut state = loading();
        let event = state.apply_frame(r#"{"status":"COMPLETED"}"#);
        assert!(matches!(event, Some(RealtimeEvent::Failed(_))));
        assert!(state.error.is_some());
    }

    #[test]
    fn error_shapes_fail_the_generation() {
        let mut state = loading();
        assert_eq!(
            state.apply_frame(r#"{"error":{"message":"Unauthorized"}}"#),
            Some(RealtimeEvent::Failed("Unauthorized".to_string()))
        );

        let mut state = loading();
        assert_eq!(
            state.apply_frame(r#"{"message":"Invalid key"}"#),
            Some(RealtimeEvent::Failed("Invalid key".to_string()))
        );

        let mut state = loading();
        assert_eq!(
            state.apply_frame(r#"{"logs":[{"level":"INFO","message":"ok"},{"level":"ERROR","message":"CUDA OOM"}]}"#),
            Some(RealtimeEvent::Failed("CUDA OOM".to_string()))
        );

        let mut state = loading();
        assert!(matches!(state.apply_frame("{not json"), Some(RealtimeEvent::Failed(_))));
        assert!(!state.is_loading);
    }

    #[test]
    fn info_frames_are_ignored() {
        let mut state = loading();
        assert_eq!(state.apply_frame(r#"{"status":"IN_PROGRESS"}"#), None);
        assert!(state.is_loading);
    }

    #[test]
    fn abnormal_close_while_loading_is_a_failure() {
        let mut state = loading();
        assert!(matches!(state.apply_close(Some(1006)), Some(RealtimeEvent::Failed(_))));
        assert_eq!(
            state.error.as_deref(),
            Some("Realtime connection closed unexpectedly (code 1006)")
        );
    }

    #[test]
    fn normal_close_while_loading_reports_closed() {
        let mut state = loading();
        assert_eq!(state.apply_close(None), Some(RealtimeEvent::Closed));
        let mut state = loading();
        assert_eq!(state.apply_close(Some(1000)), Some(RealtimeEvent::Closed));
        assert!(state.error.is_none());
    }

    #[test]
    fn close_after_done_or_error_is_silent() {
        let mut state = loading();
        let _ = state.apply_frame(r#"{"status":"COMPLETED","images":[{"url":"u"}]}"#);
        assert_eq!(state.apply_close(Some(1006)), None);

        let mut state = loading();
        let _ = state.apply_frame(r#"{"error":"boom"}"#);
        assert_eq!(state.apply_close(Some(1011)), None);
        assert_eq!(state.error.as_deref(), Some("boom"));
    }

    #[test]
    fn disconnect_keeps_last_image() {
        let mut state = loading();
        let _ = state.apply_frame(r#"{"images":[{"url":"u1"}]}"#);
        state.disconnect();
        assert!(!state.is_loading);
        assert_eq!(state.image_url.as_deref(), Some("u1"));
    }

    #[test]
    fn socket_url_swaps_scheme() {
        assert_eq!(
            realtime_ws_url("https://fal.run/", "fal-ai/fast-lcm-diffusion"),
            "wss://fal.run/fal-ai/fast-lcm-diffusion/ws"
        );
        assert_eq!(realtime_ws_url("http://127.0.0.1:9000", "m"), "ws://127.0.0.1:9000/m/ws");
    }

    #[test]
    fn frame_carries_size_and_auth() {
        let mut options = DispatchOptions::new("p", Dimensions { width: 512, height: 288 }, "16:9");
        options.params.seed = Some(42);
        let frame = build_generation_frame(&options, " key-1 ");
        assert_eq!(frame["image_size"], json!({"width": 512, "height": 288}));
        assert_eq!(frame["seed"], json!(42));
        assert_eq!(frame["sync_mode"], json!(true));
        assert_eq!(frame["key"], json!("key-1"));
    }

    #[test]
    fn disconnect_returns_while_handshake_is_stalled() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let (hold_tx, hold_rx) = mpsc::channel();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let _ = hold_tx.send(stream);
            }
        });

        let mut channel = RealtimeChannel::new(format!("http://127.0.0.1:{port}"), Arc::new(|_: RealtimeUpdate| {}));
        let options = DispatchOptions::new("p", Dimensions { width: 512, height: 512 }, "1:1");
        let first = channel.generate("key", "m", &options)?;
        let _silent_peer = hold_rx.recv_timeout(Duration::from_secs(5))?;

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            channel.disconnect();
            let second = channel.generate("key", "m", &options).ok();
            channel.disconnect();
            let _ = done_tx.send((second, channel.state()));
        });
        let (second, state) = done_rx.recv_timeout(Duration::from_secs(2))?;
        assert_eq!(second, Some(first + 1));
        assert!(!state.is_loading);
        Ok(())
    }
}
