//! Server side of a port.
//!
//! A [`Dispatcher`] serves a [`Router`] on every port it is given. Each
//! port becomes a channel with its own table of active subscriptions; the
//! table is emptied, and every stream released, when the port goes away.
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use may::coroutine::{self, JoinHandle};
use may::go;
use may::sync::{Mutex, MutexGuard};
use serde::Deserialize;
use serde_json::Value;

use crate::debug::{self, DebugOptions, Recorder, Side, Span};
use crate::envelope::{self, Method, Params, Request, Response};
use crate::errors::{ErrorCode, RpcError};
use crate::observable::{Emitter, StreamSink, Unsubscribe};
use crate::port::{Acceptor, Closer, Port, PortHandle, PortSource};
use crate::router::{Output, Router, RouterError};
use crate::transformer::{Identity, Transformer};

macro_rules! t {
    ($e: expr) => {
        match $e {
            Ok(val) => val,
            Err(err) => {
                error!("call = {:?}\nerr = {:?}", stringify!($e), err);
                continue;
            }
        }
    };
}

type ContextFn<C> = Arc<dyn Fn(&PortHandle) -> Result<C, RpcError> + Send + Sync>;
type OnErrorFn<C> = Arc<dyn Fn(&ErrorReport<'_, C>) + Send + Sync>;

/// A procedure level failure, handed to the `on_error` callback.
pub struct ErrorReport<'a, C> {
    /// the normalized error, exactly as sent to the caller
    pub error: &'a RpcError,
    pub method: Method,
    pub path: &'a str,
    pub input: Option<&'a Value>,
    /// `None` when building the context itself failed
    pub ctx: Option<&'a C>,
    /// the port the request came from
    pub port: &'a PortHandle,
}

/// Configures a [`Dispatcher`].
pub struct DispatcherBuilder<C> {
    router: Router<C>,
    context: ContextFn<C>,
    on_error: Option<OnErrorFn<C>>,
    transformer: Arc<dyn Transformer>,
    debug: DebugOptions,
    dev: bool,
}

impl<C: Send + Sync + 'static> DispatcherBuilder<C> {
    fn new(router: Router<C>, context: ContextFn<C>) -> Self {
        DispatcherBuilder {
            router,
            context,
            on_error: None,
            transformer: Arc::new(Identity),
            debug: DebugOptions::from_env(),
            dev: cfg!(debug_assertions),
        }
    }

    /// Build the context of every request, called once per request.
    pub fn context<F>(mut self, f: F) -> Self
    where
        F: Fn(&PortHandle) -> Result<C, RpcError> + Send + Sync + 'static,
    {
        self.context = Arc::new(f);
        self
    }

    /// Observe every procedure failure.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ErrorReport<'_, C>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
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

    /// send `stack` and `cause` of errors to the caller
    pub fn dev(mut self, dev: bool) -> Self {
        self.dev = dev;
        self
    }

    /// Check the router and create the dispatcher.
    pub fn build(self) -> Result<Dispatcher<C>, RouterError> {
        self.router.validate()?;
        Ok(Dispatcher {
            shared: Arc::new(Shared {
                router: self.router,
                context: self.context,
                on_error: self.on_error,
                transformer: self.transformer,
                recorder: Recorder::new(self.debug),
                dev: self.dev,
            }),
        })
    }
}

struct Shared<C> {
    router: Router<C>,
    context: ContextFn<C>,
    on_error: Option<OnErrorFn<C>>,
    transformer: Arc<dyn Transformer>,
    recorder: Recorder,
    dev: bool,
}

/// Routes requests arriving on ports to procedures.
pub struct Dispatcher<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Dispatcher {
            shared: self.shared.clone(),
        }
    }
}

impl<C> fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.shared.router)
            .field("dev", &self.shared.dev)
            .finish()
    }
}

impl<C: Default + Send + Sync + 'static> Dispatcher<C> {
    /// Start configuring a dispatcher whose context is `C::default()`.
    pub fn builder(router: Router<C>) -> DispatcherBuilder<C> {
        DispatcherBuilder::new(router, Arc::new(|_| Ok(C::default())))
    }
}

impl<C: Send + Sync + 'static> Dispatcher<C> {
    /// Start configuring a dispatcher with a context factory.
    pub fn with_context<F>(router: Router<C>, context: F) -> DispatcherBuilder<C>
    where
        F: Fn(&PortHandle) -> Result<C, RpcError> + Send + Sync + 'static,
    {
        DispatcherBuilder::new(router, Arc::new(context))
    }

    pub fn router(&self) -> &Router<C> {
        &self.shared.router
    }

    pub fn recorder(&self) -> &Recorder {
        &self.shared.recorder
    }

    /// Serve every port the acceptor yields.
    ///
    /// Stopping the returned instance also closes every channel it accepted.
    pub fn serve<A: Acceptor>(&self, acceptor: A) -> io::Result<ServerInstance> {
        let dispatcher = self.clone();
        let closer = acceptor.closer();
        let accepted = Arc::new(Accepted::new());
        let registry = accepted.clone();
        let instance = go!(
            coroutine::Builder::new().name("PortRpcServer".to_owned()),
            move || {
                let mut seq = 0;
                while !registry.stopping.load(Ordering::Acquire) {
                    let port = match t!(acceptor.accept()) {
                        Some(port) => port,
                        None => break,
                    };
                    seq += 1;
                    info!("port rpc server: channel opened, port={}", port.name());
                    if let Err(e) = dispatcher.spawn_channel(port, seq, &registry) {
                        error!("port rpc server: spawn channel failed, err = {e}");
                    }
                }
                info!("port rpc server: stopped accepting");
            }
        )?;
        Ok(ServerInstance {
            accept: Some(instance),
            closer,
            accepted,
        })
    }

    fn spawn_channel(&self, port: Port, key: u64, accepted: &Arc<Accepted>) -> io::Result<()> {
        let (channel, source) = self.open(port);
        {
            let mut channels = accepted.table();
            if accepted.stopping.load(Ordering::Acquire) {
                channel.port.disconnect();
                return Ok(());
            }
            channels.insert(
                key,
                Served {
                    port: channel.port.clone(),
                    handle: None,
                },
            );
        }

        let registry = accepted.clone();
        let spawned = go!(
            coroutine::Builder::new().name(format!("PortRpcChannel-{key}")),
            move || {
                channel.run(source);
                registry.table().remove(&key);
            }
        );
        let mut channels = accepted.table();
        match spawned {
            Ok(handle) => {
                // already gone when the channel finished first
                if let Some(served) = channels.get_mut(&key) {
                    served.handle = Some(handle);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(served) = channels.remove(&key) {
                    served.port.disconnect();
                }
                Err(e)
            }
        }
    }

    /// Serve a single port.
    pub fn attach(&self, port: Port) -> io::Result<ChannelHandle<C>> {
        let (channel, source) = self.open(port);
        let running = channel.clone();
        let handle = go!(
            coroutine::Builder::new().name("PortRpcChannel".to_owned()),
            move || running.run(source)
        )?;
        Ok(ChannelHandle {
            channel,
            handle: Some(handle),
        })
    }

    fn open(&self, port: Port) -> (Arc<Channel<C>>, Box<dyn PortSource>) {
        let (handle, source) = port.split();
        let channel = Arc::new(Channel {
            port: handle,
            shared: self.shared.clone(),
            subs: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        (channel, source)
    }
}

// channels accepted by one server instance, keyed by accept order
struct Accepted {
    stopping: AtomicBool,
    channels: Mutex<HashMap<u64, Served>>,
}

impl Accepted {
    fn new() -> Self {
        Accepted {
            stopping: AtomicBool::new(false),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, Served>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Served {
    port: PortHandle,
    handle: Option<JoinHandle<()>>,
}

/// service instance
pub struct ServerInstance {
    accept: Option<JoinHandle<()>>,
    closer: Closer,
    accepted: Arc<Accepted>,
}

impl fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInstance")
            .field("accepting", &self.accept.is_some())
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl ServerInstance {
    /// Wait until the acceptor is closed, then close every channel.
    pub fn join(mut self) -> std::thread::Result<()> {
        let ret = match self.accept.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        };
        self.close_channels();
        ret
    }

    /// Stop accepting and close every channel.
    ///
    /// Returns once each channel has released its subscriptions. Dropping
    /// the instance does the same.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// number of channels still being served
    pub fn channel_count(&self) -> usize {
        self.accepted.table().len()
    }

    fn stop(&mut self) {
        self.accepted.stopping.store(true, Ordering::Release);
        (self.closer)();
        if let Some(handle) = self.accept.take() {
            if handle.join().is_err() {
                error!("port rpc server: accept loop panicked");
            }
        }
        self.close_channels();
    }

    fn close_channels(&mut self) {
        self.accepted.stopping.store(true, Ordering::Release);
        let channels: Vec<_> = self.accepted.table().drain().map(|(_, served)| served).collect();
        if channels.is_empty() {
            return;
        }
        info!("port rpc server: closing {} channels", channels.len());
        // disconnect all first so the channels wind down together
        for served in &channels {
            served.port.disconnect();
        }
        for served in channels {
            if let Some(handle) = served.handle {
                handle.join().ok();
            }
        }
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A port served by [`Dispatcher::attach`].
///
/// Dropping the handle leaves the channel running until its port closes.
pub struct ChannelHandle<C> {
    channel: Arc<Channel<C>>,
    handle: Option<JoinHandle<()>>,
}

impl<C> fmt::Debug for ChannelHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("port", &self.channel.port)
            .finish()
    }
}

impl<C: Send + Sync + 'static> ChannelHandle<C> {
    pub fn port(&self) -> &PortHandle {
        &self.channel.port
    }

    /// number of subscriptions currently running on the channel
    pub fn subscription_count(&self) -> usize {
        self.channel.table().len()
    }

    /// Disconnect the port, the channel releases its subscriptions.
    pub fn close(&self) {
        self.channel.port.disconnect();
    }

    /// wait until the port is closed and the channel cleaned up
    pub fn join(mut self) -> std::thread::Result<()> {
        match self.handle.take() {
            Some(h) => h.join(),
            None => Ok(()),
        }
    }
}

// a subscription without `release` is still starting
struct Slot {
    release: Option<Unsubscribe>,
    span: Option<Span>,
}

struct Channel<C> {
    port: PortHandle,
    shared: Arc<Shared<C>>,
    subs: Mutex<HashMap<String, Slot>>,
    closed: AtomicBool,
}

impl<C> Drop for Channel<C> {
    fn drop(&mut self) {
        // reached without `close` when the channel coroutine was cancelled
        let drained: Vec<_> = self
            .subs
            .lock()
            .map(|mut subs| subs.drain().collect())
            .unwrap_or_default();
        for (id, slot) in drained {
            if let Some(unsubscribe) = slot.release {
                release(&id, unsubscribe);
            }
        }
    }
}

fn release(id: &str, unsubscribe: Unsubscribe) {
    match panic::catch_unwind(AssertUnwindSafe(unsubscribe)) {
        Ok(Ok(())) => info!("subscription released: id={id}"),
        Ok(Err(e)) => warn!("subscription release failed: id={id}, err = {e}"),
        Err(p) => warn!(
            "subscription release panicked: id={id}, err = {}",
            RpcError::from_panic(p)
        ),
    }
}

impl<C: Send + Sync + 'static> Channel<C> {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(self: Arc<Self>, mut source: Box<dyn PortSource>) {
        loop {
            match source.recv() {
                Ok(Some(msg)) => self.handle(msg),
                Ok(None) => {
                    info!("channel closed: port={}", self.port.name());
                    break;
                }
                Err(e) => {
                    error!("channel recv: port={}, err = {:?}", self.port.name(), e);
                    break;
                }
            }
        }
        self.close();
    }

    /// Release every subscription, errors and panics are logged and skipped.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.table().drain().collect();
        for (id, slot) in drained {
            self.shared
                .recorder
                .finish(slot.span, debug::Outcome::Disconnected);
            if let Some(unsubscribe) = slot.release {
                release(&id, unsubscribe);
            }
        }
    }

    fn send(&self, rsp: &Response) {
        let msg = match envelope::wrap(rsp) {
            Ok(msg) => msg,
            Err(e) => {
                error!("channel encode rsp: id={}, err = {}", rsp.id, e);
                return;
            }
        };
        self.shared.recorder.message(Side::Dispatcher, "send", &msg);
        if let Err(e) = self.port.post_message(msg) {
            info!("channel send rsp: id={}, err = {}", rsp.id, e);
        }
    }

    fn send_error(&self, id: &str, err: &RpcError) {
        self.send(&Response::error(id, err.to_shape(self.shared.dev)));
    }

    fn report(
        &self,
        error: &RpcError,
        method: Method,
        path: &str,
        input: Option<&Value>,
        ctx: Option<&C>,
    ) {
        if let Some(ref on_error) = self.shared.on_error {
            let report = ErrorReport {
                error,
                method,
                path,
                input,
                ctx,
                port: &self.port,
            };
            if panic::catch_unwind(AssertUnwindSafe(|| on_error(&report))).is_err() {
                warn!("on_error callback panicked, path={path}");
            }
        }
    }

    fn handle(self: &Arc<Self>, msg: Value) {
        self.shared.recorder.message(Side::Dispatcher, "recv", &msg);
        let Some(msg) = envelope::unwrap(msg) else {
            debug!("channel ignored unrelated message");
            return;
        };
        let req = match Request::deserialize(&msg) {
            Ok(req) => req,
            Err(e) => {
                let err = RpcError::new(ErrorCode::ParseError, format!("malformed request: {e}"));
                match msg.get("id").and_then(Value::as_str) {
                    Some(id) => self.send_error(id, &err),
                    None => warn!("channel dropped malformed request: err = {e}"),
                }
                return;
            }
        };

        info!("get request: id={}, method={}", req.id, req.method.as_str());
        match req.method {
            Method::SubscriptionStop => self.stop(&req.id),
            Method::Query | Method::Mutation => {
                let channel = self.clone();
                go!(move || channel.call(req));
            }
            Method::Subscription => {
                let path = req.params.as_ref().map(|p| p.path.as_str()).unwrap_or("");
                if !self.reserve(&req.id, path) {
                    let err = RpcError::bad_request(format!(
                        "subscription id \"{}\" is already in use",
                        req.id
                    ));
                    self.send_error(&req.id, &err);
                    return;
                }
                let channel = self.clone();
                go!(move || channel.subscribe(req));
            }
        }
    }

    fn reserve(&self, id: &str, path: &str) -> bool {
        let mut subs = self.table();
        if self.closed.load(Ordering::Acquire) || subs.contains_key(id) {
            return false;
        }
        let span = self
            .shared
            .recorder
            .begin(Side::Dispatcher, Method::Subscription.as_str(), path, id);
        subs.insert(
            id.to_owned(),
            Slot {
                release: None,
                span,
            },
        );
        true
    }

    // hands the release back when the slot is already gone
    fn activate(&self, id: &str, unsubscribe: Unsubscribe) -> Option<Unsubscribe> {
        let mut subs = self.table();
        match subs.get_mut(id) {
            Some(slot) if !self.closed.load(Ordering::Acquire) => {
                slot.release = Some(unsubscribe);
                None
            }
            _ => Some(unsubscribe),
        }
    }

    fn is_tracking(&self, id: &str) -> bool {
        !self.closed.load(Ordering::Acquire) && self.table().contains_key(id)
    }

    fn finish(&self, id: &str, outcome: debug::Outcome) -> bool {
        let Some(slot) = self.table().remove(id) else {
            return false;
        };
        self.shared.recorder.finish(slot.span, outcome);
        if let Some(unsubscribe) = slot.release {
            release(id, unsubscribe);
        }
        true
    }

    fn stop(&self, id: &str) {
        if !self.finish(id, debug::Outcome::Cancelled) {
            debug!("stop for unknown subscription ignored: id={id}");
        }
    }

    /// Build the context, resolve the path and run the procedure.
    fn invoke(
        &self,
        method: Method,
        path: &str,
        input: Option<&Value>,
        ctx: &mut Option<C>,
    ) -> Result<Output, RpcError> {
        let shared = &self.shared;
        let ctx = ctx.insert((shared.context)(&self.port)?);
        let procedure = shared.router.resolve_for(path, method)?;
        let input = shared
            .transformer
            .deserialize(input.cloned().unwrap_or(Value::Null))?;
        match panic::catch_unwind(AssertUnwindSafe(|| procedure.call(ctx, input))) {
            Ok(ret) => ret.map_err(RpcError::normalize),
            Err(p) => Err(RpcError::from_panic(p)),
        }
    }

    fn call(&self, req: Request) {
        let Request {
            id, method, params, ..
        } = req;
        let Some(Params { path, input }) = params else {
            self.send_error(&id, &RpcError::bad_request("missing params"));
            return;
        };
        let span = self
            .shared
            .recorder
            .begin(Side::Dispatcher, method.as_str(), &path, &id);

        let mut ctx = None;
        let result = self
            .invoke(method, &path, input.as_ref(), &mut ctx)
            .and_then(|output| match output {
                Output::Value(value) => self.shared.transformer.serialize(value),
                Output::Stream(_) => Err(RpcError::internal("procedure returned a stream")),
            });
        match result {
            Ok(value) => {
                info!("send rsp: id={id}");
                self.send(&Response::data(&id, value));
                self.shared.recorder.finish(span, debug::Outcome::Ok);
            }
            Err(err) => {
                let err = with_path(err, &path);
                self.report(&err, method, &path, input.as_ref(), ctx.as_ref());
                self.send_error(&id, &err);
                self.shared.recorder.finish(span, debug::Outcome::Failed);
            }
        }
    }

    fn subscribe(self: Arc<Self>, req: Request) {
        let Request { id, params, .. } = req;
        let Some(Params { path, input }) = params else {
            self.finish(&id, debug::Outcome::Failed);
            self.send_error(&id, &RpcError::bad_request("missing params"));
            return;
        };

        let mut ctx = None;
        let observable = match self.invoke(Method::Subscription, &path, input.as_ref(), &mut ctx) {
            Ok(Output::Stream(observable)) => observable,
            Ok(Output::Value(_)) => {
                let err = RpcError::internal("subscription returned a value").with_path(&path);
                self.fail_start(&id, &path, input.as_ref(), ctx.as_ref(), err);
                return;
            }
            Err(err) => {
                let err = with_path(err, &path);
                self.fail_start(&id, &path, input.as_ref(), ctx.as_ref(), err);
                return;
            }
        };

        // stopped while the procedure ran
        if !self.is_tracking(&id) {
            return;
        }
        self.send(&Response::started(&id));

        let sink = Arc::new(StreamOut {
            channel: self.clone(),
            id: id.clone(),
            path,
            input,
            ctx,
        });
        let emitter = Emitter::new(sink);
        match panic::catch_unwind(AssertUnwindSafe(|| observable.subscribe(emitter.clone()))) {
            Ok(Ok(unsubscribe)) => {
                if let Some(unsubscribe) = self.activate(&id, unsubscribe) {
                    release(&id, unsubscribe);
                }
            }
            Ok(Err(e)) => emitter.error(e),
            Err(p) => emitter.error(RpcError::from_panic(p)),
        }
    }

    fn fail_start(&self, id: &str, path: &str, input: Option<&Value>, ctx: Option<&C>, err: RpcError) {
        if self.finish(id, debug::Outcome::Failed) {
            self.report(&err, Method::Subscription, path, input, ctx);
            self.send_error(id, &err);
        }
    }
}

fn with_path(err: RpcError, path: &str) -> RpcError {
    if err.path().is_some() {
        err
    } else {
        err.with_path(path)
    }
}

/// Forwards the events of one stream to the channel.
struct StreamOut<C> {
    channel: Arc<Channel<C>>,
    id: String,
    path: String,
    input: Option<Value>,
    ctx: Option<C>,
}

impl<C: Send + Sync + 'static> StreamSink for StreamOut<C> {
    fn data(&self, value: Value) {
        if !self.is_active() {
            return;
        }
        match self.channel.shared.transformer.serialize(value) {
            Ok(value) => self.channel.send(&Response::data(&self.id, value)),
            Err(e) => error!("stream item dropped: id={}, err = {}", self.id, e),
        }
    }

    fn error(&self, err: RpcError) {
        let err = with_path(err, &self.path);
        // first of error, completion, stop or disconnect wins
        if !self.channel.finish(&self.id, debug::Outcome::Failed) {
            return;
        }
        self.channel.report(
            &err,
            Method::Subscription,
            &self.path,
            self.input.as_ref(),
            self.ctx.as_ref(),
        );
        self.channel.send_error(&self.id, &err);
    }

    fn complete(&self) {
        if self.channel.finish(&self.id, debug::Outcome::Ok) {
            self.channel.send(&Response::stopped(&self.id));
        }
    }

    fn is_active(&self) -> bool {
        self.channel.is_tracking(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Outcome;
    use crate::observable::Observable;
    use crate::port::memory::pair;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn send(port: &Port, req: &Request) {
        port.post_message(envelope::wrap(req).unwrap()).unwrap();
    }

    fn recv(port: &mut Port) -> Response {
        let msg = port.recv().unwrap().unwrap();
        serde_json::from_value(envelope::unwrap(msg).unwrap()).unwrap()
    }

    fn router() -> Router<()> {
        Router::new()
            .nest(
                "storage",
                Router::new().query("get", |_, key: String| {
                    Ok::<_, RpcError>(format!("value of {key}"))
                }),
            )
            .mutation("fail", |_, _: ()| -> Result<(), RpcError> {
                Err(RpcError::new(ErrorCode::Forbidden, "nope"))
            })
            .query("panic", |_, _: ()| -> Result<(), RpcError> { panic!("kaboom") })
            .subscription("pair", |_, _: ()| {
                Ok::<_, RpcError>(Observable::from_iter(vec!["x", "y"]))
            })
            .subscription("forever", |_, _: ()| {
                Ok::<_, RpcError>(Observable::new(|_emitter| {
                    Ok(Box::new(|| Ok(())) as Unsubscribe)
                }))
            })
    }

    #[test]
    fn query_returns_data() {
        let dispatcher = Dispatcher::builder(router()).build().unwrap();
        let (mut client, server) = pair("t");
        let _channel = dispatcher.attach(server).unwrap();

        send(&client, &Request::call("1", Method::Query, "storage.get", json!("k")));
        let rsp = recv(&mut client);
        assert_eq!(rsp.id, "1");
        assert_eq!(rsp.into_outcome(), Outcome::Data(json!("value of k")));
    }

    #[test]
    fn failures_are_reported_once() {
        let reports = Arc::new(AtomicUsize::new(0));
        let seen = reports.clone();
        let dispatcher = Dispatcher::builder(router())
            .on_error(move |report| {
                assert_eq!(report.path, "fail");
                assert_eq!(report.error.code(), ErrorCode::Forbidden);
                assert!(report.ctx.is_some());
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();
        let (mut client, server) = pair("t");
        let _channel = dispatcher.attach(server).unwrap();

        send(&client, &Request::call("1", Method::Mutation, "fail", Value::Null));
        match recv(&mut client).into_outcome() {
            Outcome::Failed(shape) => {
                assert_eq!(RpcError::from_shape(shape).code(), ErrorCode::Forbidden)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panics_become_internal_errors() {
        let dispatcher = Dispatcher::builder(router()).build().unwrap();
        let (mut client, server) = pair("t");
        let _channel = dispatcher.attach(server).unwrap();

        send(&client, &Request::call("1", Method::Query, "panic", Value::Null));
        send(&client, &Request::call("2", Method::Query, "storage.get", json!("k")));
        let mut outcomes = HashMap::new();
        for _ in 0..2 {
            let rsp = recv(&mut client);
            outcomes.insert(rsp.id.clone(), rsp.into_outcome());
        }
        match outcomes.remove("1") {
            Some(Outcome::Failed(shape)) => assert_eq!(shape.code, -32603),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(outcomes.remove("2"), Some(Outcome::Data(_))));
    }

    #[test]
    fn wrong_method_and_missing_path() {
        let dispatcher = Dispatcher::builder(router()).build().unwrap();
        let (mut client, server) = pair("t");
        let _channel = dispatcher.attach(server).unwrap();

        send(&client, &Request::call("1", Method::Query, "pair", Value::Null));
        let rsp = recv(&mut client);
        let Outcome::Failed(shape) = rsp.into_outcome() else { panic!("expected failure") };
        assert_eq!(shape.data.unwrap().code, "METHOD_NOT_SUPPORTED");

        send(&client, &Request::call("2", Method::Query, "storage.nope", Value::Null));
        let rsp = recv(&mut client);
        let Outcome::Failed(shape) = rsp.into_outcome() else { panic!("expected failure") };
        assert_eq!(shape.code, -32601);
        assert!(shape.message.contains("missing segment \"nope\""));
    }

    #[test]
    fn malformed_request_with_id_gets_parse_error() {
        let dispatcher = Dispatcher::builder(router()).build().unwrap();
        let (mut client, server) = pair("t");
        let _channel = dispatcher.attach(server).unwrap();

        client
            .post_message(json!({"port-rpc": {"id": "9", "method": "explode"}}))
            .unwrap();
        let rsp = recv(&mut client);
        assert_eq!(rsp.id, "9");
        let Outcome::Failed(shape) = rsp.into_outcome() else { panic!("expected failure") };
        assert_eq!(shape.code, -32700);
    }

    #[test]
    fn subscription_streams_then_stops() {
        let dispatcher = Dispatcher::builder(router()).build().unwrap();
        let (mut client, server) = pair("t");
        let channel = dispatcher.attach(server).unwrap();

        send(&client, &Request::call("s", Method::Subscription, "pair", Value::Null));
        let outcomes: Vec<_> = (0..4).map(|_| recv(&mut client).into_outcome()).collect();
        assert_eq!(
            outcomes,
            vec![
                Outcome::Started,
                Outcome::Data(json!("x")),
                Outcome::Data(json!("y")),
                Outcome::Stopped
            ]
        );
        assert_eq!(channel.subscription_count(), 0);
    }

    #[test]
    fn duplicate_subscription_id_is_rejected() {
        let dispatcher = Dispatcher::builder(router()).build().unwrap();
        let (mut client, server) = pair("t");
        let channel = dispatcher.attach(server).unwrap();

        send(&client, &Request::call("s", Method::Subscription, "forever", Value::Null));
        assert_eq!(recv(&mut client).into_outcome(), Outcome::Started);
        send(&client, &Request::call("s", Method::Subscription, "forever", Value::Null));
        let Outcome::Failed(shape) = recv(&mut client).into_outcome() else {
            panic!("expected failure")
        };
        assert_eq!(shape.data.unwrap().code, "BAD_REQUEST");
        assert_eq!(channel.subscription_count(), 1);

        send(&client, &Request::stop("s"));
        send(&client, &Request::stop("unknown"));
        for _ in 0..100 {
            if channel.subscription_count() == 0 {
                break;
            }
            may::coroutine::sleep(Duration::from_millis(5));
        }
        assert_eq!(channel.subscription_count(), 0);
    }

    #[test]
    fn router_problems_fail_the_build() {
        let router = Router::<()>::new().query("", |_, _: ()| Ok::<_, RpcError>(()));
        assert!(Dispatcher::builder(router).build().is_err());
    }

    #[test]
    fn debug_shows_the_routes() {
        let dispatcher = Dispatcher::builder(router()).dev(false).build().unwrap();
        let text = format!("{dispatcher:?}");
        assert!(text.starts_with("Dispatcher { router: Router { paths: ["));
        assert!(text.ends_with("dev: false }"));
    }
}
