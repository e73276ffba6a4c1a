#[macro_use]
extern crate log;

use std::sync::Arc;

use port_rpc::port::{MemoryHost, TcpAcceptor, TcpTransport};
use port_rpc::{Dispatcher, InvokeOptions, Link, LinkOptions, Method};
use serde_json::json;

mod storage;

use storage::{Ctx, Entry, Store};

fn dispatcher() -> Dispatcher<Ctx> {
    Dispatcher::with_context(storage::router(Arc::new(Store::default())), |port| {
        Ok(Ctx {
            caller: port.name().to_owned(),
        })
    })
    .on_error(|report| {
        warn!(
            "{} {} failed for {}: {}",
            report.method.as_str(),
            report.path,
            report.port.name(),
            report.error
        )
    })
    .build()
    .unwrap()
}

fn test_memory() {
    let host = MemoryHost::new();
    let server = dispatcher().serve(host.listen().unwrap()).unwrap();

    let popup = Link::connect(&host, LinkOptions::default().name("popup")).unwrap();
    let options = Link::connect(&host, LinkOptions::default().name("options")).unwrap();

    let me: String = popup.query("whoami", ()).unwrap();
    println!("popup is {me:?}");

    // the options page follows every change made by the popup
    let watch = options
        .subscribe("storage.watch", (), InvokeOptions::no_timeout())
        .unwrap();
    let canceller = watch.canceller();
    let watcher = may::go!(move || {
        for change in watch {
            println!("options saw change: {:?}", change);
        }
        println!("options stopped watching");
    });

    for i in 0..3 {
        let entry = Entry {
            key: "theme".into(),
            value: json!(format!("dark-{i}")),
        };
        let changed: bool = popup.mutation("storage.set", &entry).unwrap();
        println!("set theme: changed={changed}");
    }
    let theme: Option<String> = popup.query("storage.get", "theme").unwrap();
    println!("theme = {theme:?}");

    let denied = popup.mutation::<_, bool>(
        "storage.set",
        Entry {
            key: "_version".into(),
            value: json!(2),
        },
    );
    println!("read only key: {:?}", denied.map_err(|e| e.code()));

    let ticks: Vec<_> = popup
        .subscribe("ticks", (5, 10), InvokeOptions::default())
        .unwrap()
        .collect();
    println!("ticks = {ticks:?}");

    let call = popup
        .request(Method::Query, "slow", json!(200), InvokeOptions::timeout_ms(50))
        .unwrap();
    println!("slow query: {:?}", call.wait().map_err(|e| e.to_string()));

    canceller.cancel();
    watcher.join().unwrap();

    drop(options);
    drop(popup);
    host.close();
    server.join().ok();
}

fn test_tcp() {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").unwrap();
    let addr = acceptor.local_addr().unwrap();
    let _server = dispatcher().serve(acceptor).unwrap();

    let transport = TcpTransport::new(addr).unwrap();
    let link = Link::connect(&transport, LinkOptions::default()).unwrap();
    let me: String = link.query("whoami", ()).unwrap();
    println!("tcp caller is {me:?}");

    for i in 0..10 {
        let data: Option<serde_json::Value> = link.query("storage.get", format!("k{i}")).unwrap();
        println!("recv = {:?}", data);
    }

    let err = link.query::<_, u64>("no.such.path", ()).unwrap_err();
    println!("missing path: {}", err);
}

fn main() {
    env_logger::init();

    test_memory();
    test_tcp();
}
