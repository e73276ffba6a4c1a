use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use port_rpc::debug::{self, DebugOptions};
use port_rpc::envelope::{self, Method, Request, Response};
use port_rpc::port::memory::pair;
use port_rpc::port::{MemoryHost, TcpAcceptor, TcpTransport};
use port_rpc::{
    next_id, BoxError, Dispatcher, ErrorCode, InvokeOptions, Link, LinkOptions, Observable, Router,
    RpcError, ServerInstance, Transformer, Unsubscribe,
};
use serde_json::{json, Value};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn storage() -> Router<()> {
    Router::new()
        .nest(
            "storage",
            Router::new()
                .query("get", |_, key: String| {
                    Ok::<_, RpcError>(if key == "k" { "v".to_owned() } else { key })
                })
                .mutation("set", |_, (key, _value): (String, Value)| {
                    if key == "locked" {
                        Err(RpcError::new(ErrorCode::Conflict, "key is locked"))
                    } else {
                        Ok(true)
                    }
                }),
        )
        .nest(
            "a",
            Router::new().nest("x", Router::new().query("c", |_, _: ()| Ok::<_, RpcError>(1))),
        )
        .mutation("slow", |_, ms: u64| {
            may::coroutine::sleep(Duration::from_millis(ms));
            Ok::<_, RpcError>(ms)
        })
        .subscription("letters", |_, _: ()| {
            Ok::<_, RpcError>(Observable::from_iter(vec!["x", "y"]))
        })
}

fn serve(router: Router<()>) -> (Arc<MemoryHost>, ServerInstance) {
    init_log();
    let host = MemoryHost::new();
    let dispatcher = Dispatcher::builder(router).build().unwrap();
    let server = dispatcher.serve(host.listen().unwrap()).unwrap();
    (host, server)
}

#[test]
fn ids_are_pairwise_distinct() {
    let ids: HashSet<String> = (0..50_000).map(|_| next_id()).collect();
    assert_eq!(ids.len(), 50_000);
}

#[test]
fn scenario_a_query_on_the_wire() {
    init_log();
    let dispatcher = Dispatcher::builder(storage()).build().unwrap();
    let (mut client, server) = pair("wire");
    let _channel = dispatcher.attach(server).unwrap();

    client
        .post_message(json!({"port-rpc": {
            "id": "1", "method": "query", "params": {"path": "storage.get", "input": "k"}
        }}))
        .unwrap();
    let rsp = client.recv().unwrap().unwrap();
    assert_eq!(
        rsp,
        json!({"port-rpc": {"id": "1", "result": {"type": "data", "data": "v"}}})
    );
}

#[test]
fn scenario_a_query_through_a_link() {
    let (host, _server) = serve(storage());
    let link = Link::connect(&host, LinkOptions::default()).unwrap();
    let v: String = link.query("storage.get", "k").unwrap();
    assert_eq!(v, "v");
    assert!(link.mutation::<_, bool>("storage.set", ("a", 1)).unwrap());
}

#[test]
fn scenario_b_mutation_times_out() {
    init_log();
    // nobody answers on the other end
    let (client, _server) = pair("silent");
    let link = Link::with_port(client, LinkOptions::default()).unwrap();
    let call = link
        .request(
            Method::Mutation,
            "storage.set",
            json!(["k", "v"]),
            InvokeOptions::timeout_ms(50),
        )
        .unwrap();
    let err = call.wait().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert!(err.message().contains("50"));
    assert!(err.message().contains("storage.set"));
    assert!(link.is_connected());
}

#[test]
fn scenario_c_subscription_streams_then_completes() {
    let (host, _server) = serve(storage());
    let link = Link::connect(&host, LinkOptions::default()).unwrap();
    let sub = link
        .subscribe("letters", (), InvokeOptions::default())
        .unwrap();
    let values: Result<Vec<Value>, RpcError> = sub.collect();
    assert_eq!(values.unwrap(), vec![json!("x"), json!("y")]);
    assert_eq!(link.pending_count(), 0);
}

#[test]
fn scenario_d_cancel_before_data() {
    init_log();
    let (subscribed_tx, subscribed_rx) = mpsc::channel();
    let (released_tx, released_rx) = mpsc::channel();
    let subscribed_tx = std::sync::Mutex::new(subscribed_tx);
    let released_tx = std::sync::Mutex::new(released_tx);
    let router = Router::<()>::new().subscription("quiet", move |_, _: ()| {
        let subscribed = subscribed_tx.lock().unwrap().clone();
        let released = released_tx.lock().unwrap().clone();
        Ok::<_, RpcError>(Observable::new(move |_emitter| {
            subscribed.send(()).unwrap();
            Ok(Box::new(move || {
                released.send(()).unwrap();
                Ok(())
            }) as Unsubscribe)
        }))
    });
    let dispatcher = Dispatcher::builder(router).build().unwrap();
    let (client, server) = pair("d");
    let channel = dispatcher.attach(server).unwrap();
    let link = Link::with_port(client, LinkOptions::default()).unwrap();

    let mut sub = link.subscribe("quiet", (), InvokeOptions::default()).unwrap();
    subscribed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    sub.cancel();

    released_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(channel.subscription_count(), 0);
    assert!(sub.next().is_none());
    assert_eq!(link.pending_count(), 0);
}

#[test]
fn scenario_e_disconnect_is_not_a_timeout() {
    init_log();
    let (client, mut server) = pair("e");
    let link = Link::with_port(client, LinkOptions::default()).unwrap();
    let call = link
        .request(Method::Query, "storage.get", json!("k"), InvokeOptions::default())
        .unwrap();

    let req: Request =
        serde_json::from_value(envelope::unwrap(server.recv().unwrap().unwrap()).unwrap())
            .unwrap();
    assert_eq!(req.id, call.id());
    server.disconnect();

    let err = call.wait().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Disconnected);
    assert!(!err.is_timeout());
    assert!(!link.is_connected());
}

#[test]
fn one_terminal_outcome_per_invocation() {
    let (host, _server) = serve(storage());
    let link = Link::connect(&host, LinkOptions::default()).unwrap();

    // the response arrives after the timeout and is discarded
    let call = link
        .request(Method::Mutation, "slow", json!(100), InvokeOptions::timeout_ms(20))
        .unwrap();
    assert!(call.wait().unwrap_err().is_timeout());
    may::coroutine::sleep(Duration::from_millis(200));
    assert_eq!(link.pending_count(), 0);

    // the link keeps working
    let ms: u64 = link.mutation("slow", 1).unwrap();
    assert_eq!(ms, 1);
}

#[test]
fn settled_invocations_leave_no_timer() {
    let (host, _server) = serve(storage());
    let opts = LinkOptions::default()
        .timeout_ms(50)
        .debug(DebugOptions::level(0).with_performance());
    let link = Link::connect(&host, opts).unwrap();

    let v: String = link.query("storage.get", "k").unwrap();
    assert_eq!(v, "v");
    may::coroutine::sleep(Duration::from_millis(120));

    let samples = link.recorder().recent();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].outcome, debug::Outcome::Ok);
}

#[test]
fn disconnect_releases_every_subscription() {
    init_log();
    const K: usize = 5;
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let router = Router::<()>::new().subscription("held", move |_, n: usize| {
        let counter = counter.clone();
        Ok::<_, RpcError>(Observable::new(move |emitter| {
            emitter.next("ready");
            Ok(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                match n {
                    1 => Err(BoxError::from("release failed")),
                    2 => panic!("release panicked"),
                    _ => Ok(()),
                }
            }) as Unsubscribe)
        }))
    });
    let dispatcher = Dispatcher::builder(router).build().unwrap();
    let (client, server) = pair("p4");
    let channel = dispatcher.attach(server).unwrap();
    let link = Link::with_port(client, LinkOptions::default().no_timeout()).unwrap();

    let mut subs = Vec::new();
    for n in 0..K {
        let mut sub = link.subscribe("held", n, InvokeOptions::default()).unwrap();
        assert_eq!(sub.next().unwrap().unwrap(), json!("ready"));
        subs.push(sub);
    }
    assert_eq!(channel.subscription_count(), K);

    link.close();
    for mut sub in subs {
        let err = sub.next().unwrap().unwrap_err();
        assert!(err.is_disconnected());
    }
    let port = channel.port().clone();
    channel.join().unwrap();
    assert!(!port.is_connected());

    // a stream still starting at disconnect is released by its own coroutine
    for _ in 0..200 {
        if released.load(Ordering::SeqCst) == K {
            break;
        }
        may::coroutine::sleep(Duration::from_millis(5));
    }
    assert_eq!(released.load(Ordering::SeqCst), K);
}

#[test]
fn server_shutdown_closes_live_channels() {
    let (released_tx, released_rx) = mpsc::channel();
    let released_tx = std::sync::Mutex::new(released_tx);
    let router = Router::<()>::new()
        .query("ping", |_, _: ()| Ok::<_, RpcError>("pong"))
        .subscription("forever", move |_, _: ()| {
            let released = released_tx.lock().unwrap().clone();
            Ok::<_, RpcError>(Observable::new(move |emitter| {
                emitter.next("ready");
                Ok(Box::new(move || {
                    released.send(()).unwrap();
                    Ok(())
                }) as Unsubscribe)
            }))
        });
    let (host, server) = serve(router);

    let idle = Link::connect(&host, LinkOptions::default()).unwrap();
    let busy = Link::connect(&host, LinkOptions::default().no_timeout()).unwrap();
    let pong: String = idle.query("ping", ()).unwrap();
    assert_eq!(pong, "pong");
    let mut sub = busy.subscribe("forever", (), InvokeOptions::default()).unwrap();
    assert_eq!(sub.next().unwrap().unwrap(), json!("ready"));
    assert_eq!(server.channel_count(), 2);

    // dropped on another thread so a stuck shutdown fails instead of hanging
    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        drop(server);
        done_tx.send(()).unwrap();
    });
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    released_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(sub.next().unwrap().unwrap_err().is_disconnected());
    assert!(sub.next().is_none());
    let err = idle.query::<_, String>("ping", ()).unwrap_err();
    assert!(err.is_disconnected());
    assert!(Link::connect(&host, LinkOptions::default()).is_err());
}

#[test]
fn server_shutdown_with_no_channels_returns() {
    let (_host, server) = serve(storage());
    assert_eq!(server.channel_count(), 0);
    server.shutdown();
}

#[test]
fn missing_segment_is_named() {
    let (host, _server) = serve(storage());
    let link = Link::connect(&host, LinkOptions::default()).unwrap();
    let err = link.query::<_, Value>("a.b.c", ()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert!(err.message().contains("\"a.b.c\""));
    assert!(err.message().contains("\"b\""));
    assert_eq!(err.path(), Some("a.b.c"));
}

#[test]
fn structured_errors_cross_the_port() {
    let (host, _server) = serve(storage());
    let link = Link::connect(&host, LinkOptions::default()).unwrap();
    let err = link
        .mutation::<_, bool>("storage.set", ("locked", 1))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
    assert_eq!(err.message(), "key is locked");

    let err = link.query::<_, Value>("storage.get", 42).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRequest);
}

#[test]
fn production_errors_hide_internals() {
    init_log();
    let router = Router::<()>::new().query("boom", |_, _: ()| -> Result<(), std::io::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))
    });
    let dispatcher = Dispatcher::builder(router).dev(false).build().unwrap();
    let (mut client, server) = pair("prod");
    let _channel = dispatcher.attach(server).unwrap();

    let req = Request::call("1", Method::Query, "boom", Value::Null);
    client.post_message(envelope::wrap(&req).unwrap()).unwrap();
    let rsp: Response =
        serde_json::from_value(envelope::unwrap(client.recv().unwrap().unwrap()).unwrap())
            .unwrap();
    let error = rsp.error.unwrap();
    assert_eq!(error.code, -32603);
    assert_eq!(error.message, "disk gone");
    let data = error.data.unwrap();
    assert_eq!(data.code, "INTERNAL_SERVER_ERROR");
    assert!(data.stack.is_none());
    assert!(data.cause.is_none());
}

#[test]
fn context_and_error_callback() {
    init_log();
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = failures.clone();
    let router = Router::<String>::new()
        .query("whoami", |ctx: &String, _: ()| Ok::<_, RpcError>(ctx.clone()))
        .query("deny", |_: &String, _: ()| -> Result<(), RpcError> {
            Err(RpcError::new(ErrorCode::Unauthorized, "who are you"))
        });
    let dispatcher = Dispatcher::with_context(router, |port| Ok(format!("caller {}", port.name())))
        .on_error(move |report| {
            assert_eq!(report.error.code(), ErrorCode::Unauthorized);
            assert_eq!(report.ctx.map(String::as_str), Some("caller popup"));
            assert_eq!(report.port.name(), "popup");
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let host = MemoryHost::new();
    let _server = dispatcher.serve(host.listen().unwrap()).unwrap();

    let link = Link::connect(&host, LinkOptions::default().name("popup")).unwrap();
    let me: String = link.query("whoami", ()).unwrap();
    assert_eq!(me, "caller popup");
    assert!(link.query::<_, ()>("deny", ()).is_err());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

struct Tagged;

impl Transformer for Tagged {
    fn serialize(&self, value: Value) -> Result<Value, RpcError> {
        Ok(json!({ "tagged": value }))
    }

    fn deserialize(&self, value: Value) -> Result<Value, RpcError> {
        match value {
            Value::Object(mut map) => map
                .remove("tagged")
                .ok_or_else(|| RpcError::bad_request("untagged value")),
            _ => Err(RpcError::bad_request("untagged value")),
        }
    }
}

#[test]
fn transformer_applies_to_both_directions() {
    init_log();
    let dispatcher = Dispatcher::builder(storage())
        .transformer(Tagged)
        .build()
        .unwrap();
    let host = MemoryHost::new();
    let _server = dispatcher.serve(host.listen().unwrap()).unwrap();

    let link = Link::connect(&host, LinkOptions::default().transformer(Tagged)).unwrap();
    let v: String = link.query("storage.get", "k").unwrap();
    assert_eq!(v, "v");
    let letters: Vec<Value> = link
        .subscribe("letters", (), InvokeOptions::default())
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(letters, vec![json!("x"), json!("y")]);
}

#[test]
fn connect_without_host_listener_fails_fast() {
    let host = MemoryHost::new();
    assert!(Link::connect(&host, LinkOptions::default()).is_err());
}

#[test]
fn tcp_round_trip() {
    init_log();
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").unwrap();
    let addr = acceptor.local_addr().unwrap();
    let dispatcher = Dispatcher::builder(storage()).build().unwrap();
    let _server = dispatcher.serve(acceptor).unwrap();

    let transport = TcpTransport::new(addr).unwrap();
    let link = Link::connect(&transport, LinkOptions::default()).unwrap();
    let v: String = link.query("storage.get", "k").unwrap();
    assert_eq!(v, "v");

    let letters: Vec<Value> = link
        .subscribe("letters", (), InvokeOptions::default())
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(letters, vec![json!("x"), json!("y")]);

    let err = link.query::<_, Value>("a.b.c", ()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}
