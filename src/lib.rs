//! port_rpc is a query, mutation and subscription RPC protocol for message ports, based on
//! coroutines.
//!
//! A port is one bidirectional connection between two execution contexts that can
//! disconnect at any time. On top of it a [`Link`] invokes procedures by dotted path and a
//! [`Dispatcher`] routes the invocations to a [`Router`] of procedures:
//!
//! * `query` and `mutation` return exactly one value or one structured error
//! * `subscription` streams values until the server completes it, it fails, or the
//!   caller stops it with `subscription.stop`
//! * every invocation ends exactly once: response, timeout, disconnect or cancellation,
//!   whichever comes first
//!
//! Errors on both sides are [`RpcError`]s, so protocol failures (timeout, disconnect,
//! unknown path) and application failures look the same and can be told apart by their
//! [`ErrorCode`].
//!
//! Example usage:
//!
//! ```rust
//! use port_rpc::port::MemoryHost;
//! use port_rpc::{Dispatcher, Link, LinkOptions, Router, RpcError};
//!
//! let router = Router::<()>::new().query("hello", |_, name: String| {
//!     Ok::<_, RpcError>(format!("Hello, {}!", name))
//! });
//! let dispatcher = Dispatcher::builder(router).build().unwrap();
//!
//! let host = MemoryHost::new();
//! let _server = dispatcher.serve(host.listen().unwrap()).unwrap();
//!
//! let link = Link::connect(&host, LinkOptions::default()).unwrap();
//! let rsp: String = link.query("hello", "Mom").unwrap();
//! assert_eq!(rsp, "Hello, Mom!");
//! ```
//!

#[macro_use]
extern crate log;

// re-export may
pub use may;
// re-export serde_json
pub use serde_json;

pub mod debug;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod link;
pub mod observable;
pub mod port;
pub mod router;
pub mod transformer;

pub use debug::{DebugOptions, Recorder};
pub use dispatcher::{ChannelHandle, Dispatcher, DispatcherBuilder, ErrorReport, ServerInstance};
pub use envelope::{next_id, Method};
pub use errors::{BoxError, ErrorCode, RpcError};
pub use link::{Call, CancelHandle, InvokeOptions, Link, LinkOptions, Subscription};
pub use observable::{Emitter, Observable, Unsubscribe};
pub use router::{Procedure, ProcedureKind, Router, RouterError};
pub use transformer::{Identity, Transformer};
