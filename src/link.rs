//! Client side of a port.
//!
//! A [`Link`] owns one port and a table of pending invocations keyed by
//! correlation id. A listener coroutine drains the port and routes every
//! response to its invocation; whichever of response, timeout, disconnect
//! or cancellation reaches an entry first removes it from the table and is
//! the only one allowed to settle it.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Weak};
use std::time::Duration;

use may::coroutine::{self, JoinHandle};
use may::go;
use may::sync::mpsc::{self, Receiver, Sender};
use may::sync::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::debug::{self, DebugOptions, Recorder, Side, Span};
use crate::envelope::{self, next_id, Method, Outcome, Request, Response};
use crate::errors::RpcError;
use crate::port::{self, ConnectOptions, Port, PortHandle, PortSource, Transport};
use crate::transformer::{Identity, Transformer};

/// default time an invocation may stay pending
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Link configuration.
#[derive(Clone)]
pub struct LinkOptions {
    timeout: Option<Duration>,
    transformer: Arc<dyn Transformer>,
    debug: DebugOptions,
    name: Option<String>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions {
            timeout: Some(DEFAULT_TIMEOUT),
            transformer: Arc::new(Identity),
            debug: DebugOptions::from_env(),
            name: None,
        }
    }
}

impl fmt::Debug for LinkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkOptions")
            .field("timeout", &self.timeout)
            .field("debug", &self.debug)
            .field("name", &self.name)
            .finish()
    }
}

impl LinkOptions {
    /// default timeout of every invocation
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// timeout in milliseconds, zero or negative disables it
    pub fn timeout_ms(mut self, ms: i64) -> Self {
        self.timeout = millis(ms);
        self
    }

    /// never time out
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn transformer(mut self, transformer: impl Transformer) -> Self {
        self.transformer = Arc::new(transformer);
        self
    }

    pub fn debug(mut self, debug: DebugOptions) -> Self {
        self.debug = debug;
        self
    }

    /// name of the port opened by [`Link::connect`]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

fn millis(ms: i64) -> Option<Duration> {
    if ms <= 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

/// Per invocation overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvokeOptions {
    timeout: Option<Option<Duration>>,
}

impl InvokeOptions {
    pub fn timeout(timeout: Duration) -> Self {
        InvokeOptions {
            timeout: Some(Some(timeout)),
        }
    }

    /// zero or negative disables the timeout of this invocation
    pub fn timeout_ms(ms: i64) -> Self {
        InvokeOptions {
            timeout: Some(millis(ms)),
        }
    }

    pub fn no_timeout() -> Self {
        InvokeOptions {
            timeout: Some(None),
        }
    }
}

#[derive(Debug)]
enum Event {
    Started,
    Data(Value),
    Stopped,
    Failed(RpcError),
    Cancelled,
}

// dropping the sender wakes the timer coroutine, which then exits
struct Timer {
    _cancel: Sender<()>,
}

struct PendingEntry {
    method: Method,
    path: String,
    tx: Sender<Event>,
    timer: Option<Timer>,
    span: Option<Span>,
}

struct LinkInner {
    port: PortHandle,
    pending: Mutex<HashMap<String, PendingEntry>>,
    connected: AtomicBool,
    transformer: Arc<dyn Transformer>,
    timeout: Option<Duration>,
    recorder: Recorder,
}

impl LinkInner {
    fn table(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(&self, id: &str) -> Option<PendingEntry> {
        self.table().remove(id)
    }

    fn settle(&self, entry: PendingEntry, event: Event, outcome: debug::Outcome) {
        let PendingEntry { tx, span, timer, .. } = entry;
        drop(timer);
        self.recorder.finish(span, outcome);
        tx.send(event).ok();
    }

    fn post(&self, msg: &impl Serialize) -> Result<(), RpcError> {
        let wrapped = envelope::wrap(msg)?;
        self.recorder.message(Side::Link, "send", &wrapped);
        self.port
            .post_message(wrapped)
            .map_err(RpcError::disconnected)
    }

    fn post_stop(&self, id: &str) {
        if let Err(e) = self.post(&Request::stop(id)) {
            info!("link stop: id={id}, err = {e}");
        }
    }

    fn register(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        input: Value,
        options: InvokeOptions,
    ) -> Result<(String, Receiver<Event>), RpcError> {
        let id = next_id();
        let input = self.transformer.serialize(input)?;
        let request = Request::call(&id, method, path, input);
        let (tx, rx) = mpsc::channel();
        let timeout = options.timeout.unwrap_or(self.timeout);

        {
            let mut table = self.table();
            // checked under the lock so a concurrent disconnect drains this entry
            if !self.connected.load(Ordering::Acquire) {
                return Err(RpcError::disconnected("link is closed"));
            }
            let timer = timeout.map(|after| start_timer(Arc::downgrade(self), id.clone(), after));
            let span = self.recorder.begin(Side::Link, method.as_str(), path, &id);
            table.insert(
                id.clone(),
                PendingEntry {
                    method,
                    path: path.to_owned(),
                    tx,
                    timer,
                    span,
                },
            );
        }

        info!("link request: id={id}, {} {path}", method.as_str());
        if let Err(e) = self.post(&request) {
            if let Some(entry) = self.take(&id) {
                self.recorder.finish(entry.span, debug::Outcome::Disconnected);
            }
            return Err(e);
        }
        Ok((id, rx))
    }

    fn dispatch(&self, msg: Value) {
        self.recorder.message(Side::Link, "recv", &msg);
        let Some(msg) = envelope::unwrap(msg) else {
            debug!("link ignored unrelated message");
            return;
        };
        match serde_json::from_value::<Response>(msg) {
            Ok(rsp) => self.route(rsp),
            Err(e) => warn!("link dropped malformed response: err = {e}"),
        }
    }

    fn route(&self, rsp: Response) {
        let id = rsp.id.clone();
        info!("link response: id={id}");
        match rsp.into_outcome() {
            Outcome::Failed(shape) => {
                if let Some(entry) = self.take(&id) {
                    let err = RpcError::from_shape(shape);
                    self.settle(entry, Event::Failed(err), debug::Outcome::Failed);
                }
            }
            Outcome::Stopped => {
                if let Some(entry) = self.take(&id) {
                    self.settle(entry, Event::Stopped, debug::Outcome::Ok);
                }
            }
            Outcome::Started => {
                let mut table = self.table();
                match table.get_mut(&id) {
                    Some(entry) if entry.method == Method::Subscription => {
                        entry.timer = None;
                        entry.tx.send(Event::Started).ok();
                    }
                    Some(_) => warn!("link ignored started ack for a call, id={id}"),
                    None => debug!("link dropped response for unknown id={id}"),
                }
            }
            Outcome::Data(data) => self.route_data(&id, data),
        }
    }

    fn route_data(&self, id: &str, data: Value) {
        let mut table = self.table();
        let Some(entry) = table.get_mut(id) else {
            debug!("link dropped response for unknown id={id}");
            return;
        };
        let streaming = entry.method == Method::Subscription;
        match self.transformer.deserialize(data) {
            Ok(value) if streaming => {
                entry.timer = None;
                entry.tx.send(Event::Data(value)).ok();
            }
            Ok(value) => {
                if let Some(entry) = table.remove(id) {
                    drop(table);
                    self.settle(entry, Event::Data(value), debug::Outcome::Ok);
                }
            }
            Err(err) => {
                if let Some(entry) = table.remove(id) {
                    drop(table);
                    if streaming {
                        self.post_stop(id);
                    }
                    self.settle(entry, Event::Failed(err), debug::Outcome::Failed);
                }
            }
        }
    }

    fn expire(&self, id: &str, after: Duration) {
        let Some(entry) = self.take(id) else { return };
        warn!("link request timed out: id={id}, path={}", entry.path);
        if entry.method == Method::Subscription {
            self.post_stop(id);
        }
        let err = RpcError::timeout(after, &entry.path);
        self.settle(entry, Event::Failed(err), debug::Outcome::TimedOut);
    }

    fn cancel(&self, id: &str) {
        let Some(entry) = self.take(id) else { return };
        info!("link request cancelled: id={id}");
        if entry.method == Method::Subscription {
            self.post_stop(id);
        }
        self.settle(entry, Event::Cancelled, debug::Outcome::Cancelled);
    }

    fn on_disconnect(&self, reason: &str) {
        self.connected.store(false, Ordering::Release);
        let drained: Vec<_> = self.table().drain().collect();
        if !drained.is_empty() {
            warn!("link disconnected with {} pending: {reason}", drained.len());
        }
        for (_, entry) in drained {
            let err = RpcError::disconnected(reason).with_path(entry.path.clone());
            self.settle(entry, Event::Failed(err), debug::Outcome::Disconnected);
        }
    }
}

fn start_timer(link: Weak<LinkInner>, id: String, after: Duration) -> Timer {
    let (tx, rx) = mpsc::channel::<()>();
    go!(move || {
        if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(after) {
            if let Some(link) = link.upgrade() {
                link.expire(&id, after);
            }
        }
    });
    Timer { _cancel: tx }
}

fn listen(link: Arc<LinkInner>, mut source: Box<dyn PortSource>) {
    let reason = loop {
        match source.recv() {
            Ok(Some(msg)) => link.dispatch(msg),
            Ok(None) => {
                info!("link port closed: {}", link.port.name());
                break "port closed".to_owned();
            }
            Err(e) => {
                error!("link port recv: err = {:?}", e);
                break e.to_string();
            }
        }
    };
    link.on_disconnect(&reason);
}

/// Client end of a port.
pub struct Link {
    inner: Arc<LinkInner>,
    listener: Option<JoinHandle<()>>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("port", &self.inner.port)
            .field("timeout", &self.inner.timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.inner.port.disconnect();
        if let Some(h) = self.listener.take() {
            h.join().ok();
        }
    }
}

impl Link {
    /// Open a fresh port through `transport` and listen on it.
    pub fn connect<T: Transport + ?Sized>(transport: &T, options: LinkOptions) -> port::Result<Self> {
        let connect = ConnectOptions {
            name: options.name.clone(),
        };
        let port = transport.connect(&connect)?;
        Link::with_port(port, options)
    }

    /// Run a link over an already open port.
    pub fn with_port(port: Port, options: LinkOptions) -> port::Result<Self> {
        let (handle, source) = port.split();
        let inner = Arc::new(LinkInner {
            connected: AtomicBool::new(handle.is_connected()),
            port: handle,
            pending: Mutex::new(HashMap::new()),
            transformer: options.transformer,
            timeout: options.timeout,
            recorder: Recorder::new(options.debug),
        });
        let link = inner.clone();
        let listener = go!(
            coroutine::Builder::new().name("PortRpcLinkListener".to_owned()),
            move || listen(link, source)
        )?;
        Ok(Link {
            inner,
            listener: Some(listener),
        })
    }

    /// Invoke a query and wait for its result.
    pub fn query<I: Serialize, O: DeserializeOwned>(&self, path: &str, input: I) -> Result<O, RpcError> {
        self.call(Method::Query, path, input)
    }

    /// Invoke a mutation and wait for its result.
    pub fn mutation<I: Serialize, O: DeserializeOwned>(
        &self,
        path: &str,
        input: I,
    ) -> Result<O, RpcError> {
        self.call(Method::Mutation, path, input)
    }

    fn call<I: Serialize, O: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        input: I,
    ) -> Result<O, RpcError> {
        let input = encode_input(input)?;
        let value = self.request(method, path, input, InvokeOptions::default())?.wait()?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a query or mutation, the returned [`Call`] settles it.
    pub fn request(
        &self,
        method: Method,
        path: &str,
        input: Value,
        options: InvokeOptions,
    ) -> Result<Call, RpcError> {
        if !matches!(method, Method::Query | Method::Mutation) {
            return Err(RpcError::bad_request(format!(
                "\"{}\" is not a call method",
                method.as_str()
            )));
        }
        let (id, rx) = self.inner.register(method, path, input, options)?;
        Ok(Call {
            id,
            path: path.to_owned(),
            rx,
            inner: self.inner.clone(),
        })
    }

    /// Start a subscription.
    pub fn subscribe<I: Serialize>(
        &self,
        path: &str,
        input: I,
        options: InvokeOptions,
    ) -> Result<Subscription, RpcError> {
        let input = encode_input(input)?;
        let (id, rx) = self
            .inner
            .register(Method::Subscription, path, input, options)?;
        Ok(Subscription {
            id,
            rx,
            inner: self.inner.clone(),
            streaming: false,
            finished: false,
        })
    }

    /// false once the port disconnected
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// number of invocations still waiting for a terminal response
    pub fn pending_count(&self) -> usize {
        self.inner.table().len()
    }

    pub fn port(&self) -> &PortHandle {
        &self.inner.port
    }

    pub fn recorder(&self) -> &Recorder {
        &self.inner.recorder
    }

    /// Disconnect the port, every pending invocation fails with `DISCONNECTED`.
    pub fn close(&self) {
        self.inner.port.disconnect();
    }
}

fn encode_input<I: Serialize>(input: I) -> Result<Value, RpcError> {
    serde_json::to_value(input).map_err(|e| RpcError::bad_request(format!("invalid input: {e}")))
}

/// Cancels an invocation from another coroutine.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    id: String,
    inner: Weak<LinkInner>,
}

impl CancelHandle {
    /// no effect once the invocation settled
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel(&self.id);
        }
    }
}

/// A query or mutation in flight.
///
/// Dropping it without waiting cancels it locally, a late response is
/// discarded.
pub struct Call {
    id: String,
    path: String,
    rx: Receiver<Event>,
    inner: Arc<LinkInner>,
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl Call {
    /// correlation id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block until the invocation settles.
    pub fn wait(self) -> Result<Value, RpcError> {
        match self.rx.recv() {
            Ok(Event::Data(value)) => Ok(value),
            Ok(Event::Failed(err)) => Err(err),
            Ok(Event::Cancelled) => Err(RpcError::cancelled(&self.path)),
            Ok(event) => Err(RpcError::internal(format!(
                "unexpected {event:?} for a call on \"{}\"",
                self.path
            ))),
            Err(_) => Err(RpcError::disconnected("link dropped")),
        }
    }

    /// Stop waiting, the server may still run the procedure.
    pub fn cancel(self) {}

    pub fn canceller(&self) -> CancelHandle {
        CancelHandle {
            id: self.id.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.inner.cancel(&self.id);
    }
}

/// A running subscription.
///
/// Iterating yields every value the server emits; the iterator ends on
/// `stopped` or cancellation and yields one `Err` when the stream fails.
/// Dropping it sends `subscription.stop` if the stream is still running.
pub struct Subscription {
    id: String,
    rx: Receiver<Event>,
    inner: Arc<LinkInner>,
    streaming: bool,
    finished: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("streaming", &self.streaming)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// true once the server acknowledged the stream
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Stop the stream; values still in flight are discarded.
    pub fn cancel(&mut self) {
        self.inner.cancel(&self.id);
        self.finished = true;
    }

    pub fn canceller(&self) -> CancelHandle {
        CancelHandle {
            id: self.id.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Iterator for Subscription {
    type Item = Result<Value, RpcError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            match self.rx.recv() {
                Ok(Event::Started) => self.streaming = true,
                Ok(Event::Data(value)) => {
                    self.streaming = true;
                    return Some(Ok(value));
                }
                Ok(Event::Failed(err)) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                Ok(Event::Stopped) | Ok(Event::Cancelled) | Err(_) => self.finished = true,
            }
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.cancel(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Params;
    use crate::port::memory::pair;
    use serde_json::json;

    fn recv_request(port: &mut Port) -> Request {
        let msg = port.recv().unwrap().unwrap();
        serde_json::from_value(envelope::unwrap(msg).unwrap()).unwrap()
    }

    fn respond(port: &Port, rsp: &Response) {
        port.post_message(envelope::wrap(rsp).unwrap()).unwrap();
    }

    #[test]
    fn query_resolves_with_data() {
        let (client, mut server) = pair("t");
        let link = Link::with_port(client, LinkOptions::default()).unwrap();

        let h = go!(move || {
            let req = recv_request(&mut server);
            assert_eq!(req.method, Method::Query);
            assert_eq!(
                req.params,
                Some(Params {
                    path: "storage.get".into(),
                    input: Some(json!("k"))
                })
            );
            respond(&server, &Response::data(&req.id, json!("v")));
            server
        });

        let v: String = link.query("storage.get", "k").unwrap();
        assert_eq!(v, "v");
        assert_eq!(link.pending_count(), 0);
        h.join().unwrap();
    }

    #[test]
    fn first_terminal_event_wins() {
        let (client, mut server) = pair("t");
        let link = Link::with_port(client, LinkOptions::default()).unwrap();
        let call = link
            .request(Method::Mutation, "a", json!(1), InvokeOptions::default())
            .unwrap();
        let req = recv_request(&mut server);

        respond(&server, &Response::data(&req.id, json!(1)));
        respond(&server, &Response::data(&req.id, json!(2)));
        respond(
            &server,
            &Response::error(&req.id, RpcError::internal("late").to_shape(false)),
        );
        assert_eq!(call.wait().unwrap(), json!(1));
    }

    #[test]
    fn timeout_rejects_and_keeps_port_open() {
        let (client, mut server) = pair("t");
        let link = Link::with_port(client, LinkOptions::default().timeout_ms(30)).unwrap();
        let err = link.mutation::<_, Value>("slow.op", ()).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.message().contains("30"));
        assert!(err.message().contains("slow.op"));
        assert!(link.is_connected());

        // a late answer is discarded
        let req = recv_request(&mut server);
        respond(&server, &Response::data(&req.id, json!(0)));
        assert_eq!(link.pending_count(), 0);
    }

    #[test]
    fn disconnect_rejects_pending_calls() {
        let (client, mut server) = pair("t");
        let link = Link::with_port(client, LinkOptions::default()).unwrap();
        let call = link
            .request(Method::Query, "a", Value::Null, InvokeOptions::default())
            .unwrap();
        recv_request(&mut server);
        server.disconnect();

        let err = call.wait().unwrap_err();
        assert!(err.is_disconnected());

        // a dead link fails fast
        let err = link.query::<_, Value>("a", ()).unwrap_err();
        assert!(err.is_disconnected());
    }

    #[test]
    fn cancelled_call_reports_client_closed() {
        let (client, _server) = pair("t");
        let link = Link::with_port(client, LinkOptions::default()).unwrap();
        let call = link
            .request(Method::Query, "a", Value::Null, InvokeOptions::no_timeout())
            .unwrap();
        call.canceller().cancel();
        let err = call.wait().unwrap_err();
        assert_eq!(err.code(), crate::errors::ErrorCode::ClientClosedRequest);
        assert_eq!(link.pending_count(), 0);
    }

    #[test]
    fn subscription_streams_until_stopped() {
        let (client, mut server) = pair("t");
        let link = Link::with_port(client, LinkOptions::default()).unwrap();
        let sub = link
            .subscribe("ticks", (), InvokeOptions::default())
            .unwrap();
        let req = recv_request(&mut server);
        assert_eq!(req.method, Method::Subscription);

        respond(&server, &Response::started(&req.id));
        respond(&server, &Response::data(&req.id, json!("x")));
        respond(&server, &Response::data(&req.id, json!("y")));
        respond(&server, &Response::stopped(&req.id));

        let values: Vec<Value> = sub.map(|v| v.unwrap()).collect();
        assert_eq!(values, vec![json!("x"), json!("y")]);
        assert_eq!(link.pending_count(), 0);
    }

    #[test]
    fn cancelling_a_subscription_sends_stop() {
        let (client, mut server) = pair("t");
        let link = Link::with_port(client, LinkOptions::default()).unwrap();
        let mut sub = link
            .subscribe("ticks", (), InvokeOptions::default())
            .unwrap();
        let req = recv_request(&mut server);
        sub.cancel();

        let stop = recv_request(&mut server);
        assert_eq!(stop.method, Method::SubscriptionStop);
        assert_eq!(stop.id, req.id);

        respond(&server, &Response::data(&req.id, json!("late")));
        assert!(sub.next().is_none());
    }

    #[test]
    fn untyped_data_result_is_accepted() {
        let (client, mut server) = pair("t");
        let link = Link::with_port(client, LinkOptions::default()).unwrap();
        let call = link
            .request(Method::Query, "a", Value::Null, InvokeOptions::default())
            .unwrap();
        let req = recv_request(&mut server);
        let rsp = Response {
            id: req.id,
            result: Some(envelope::ResultPayload {
                kind: None,
                data: Some(json!(5)),
            }),
            error: None,
        };
        respond(&server, &rsp);
        assert_eq!(call.wait().unwrap(), json!(5));
    }
}
