//! Procedure tree.
//!
//! A [`Router`] maps names either to nested routers or to procedures, and a
//! dotted path such as `storage.local.get` walks it from the root.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::Method;
use crate::errors::{BoxError, ErrorCode, RpcError};
use crate::observable::Observable;

/// Kind of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Query,
    Mutation,
    Subscription,
}

impl ProcedureKind {
    /// the request method that invokes this kind
    pub fn method(self) -> Method {
        match self {
            ProcedureKind::Query => Method::Query,
            ProcedureKind::Mutation => Method::Mutation,
            ProcedureKind::Subscription => Method::Subscription,
        }
    }
}

/// What a procedure produced.
pub enum Output {
    Value(Value),
    Stream(Observable),
}

type Handler<C> = Arc<dyn Fn(&C, Value) -> Result<Output, BoxError> + Send + Sync>;

/// A callable leaf of the tree.
pub struct Procedure<C> {
    kind: ProcedureKind,
    handler: Handler<C>,
}

impl<C> Clone for Procedure<C> {
    fn clone(&self) -> Self {
        Procedure {
            kind: self.kind,
            handler: self.handler.clone(),
        }
    }
}

impl<C> fmt::Debug for Procedure<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure").field("kind", &self.kind).finish()
    }
}

impl<C> Procedure<C> {
    /// untyped query
    pub fn query<F>(f: F) -> Self
    where
        F: Fn(&C, Value) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Procedure {
            kind: ProcedureKind::Query,
            handler: Arc::new(move |ctx, input| f(ctx, input).map(Output::Value)),
        }
    }

    /// untyped mutation
    pub fn mutation<F>(f: F) -> Self
    where
        F: Fn(&C, Value) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Procedure {
            kind: ProcedureKind::Mutation,
            handler: Arc::new(move |ctx, input| f(ctx, input).map(Output::Value)),
        }
    }

    /// untyped subscription
    pub fn subscription<F>(f: F) -> Self
    where
        F: Fn(&C, Value) -> Result<Observable, BoxError> + Send + Sync + 'static,
    {
        Procedure {
            kind: ProcedureKind::Subscription,
            handler: Arc::new(move |ctx, input| f(ctx, input).map(Output::Stream)),
        }
    }

    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    /// run the procedure
    pub fn call(&self, ctx: &C, input: Value) -> Result<Output, BoxError> {
        (self.handler)(ctx, input)
    }
}

/// Problems found while building a router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// names must be non-empty and must not contain `.`
    #[error("invalid procedure name \"{0}\"")]
    InvalidName(String),
    /// a name is registered twice under the same parent
    #[error("duplicate procedure name \"{0}\"")]
    Duplicate(String),
}

enum Node<C> {
    Router(Router<C>),
    Procedure(Procedure<C>),
}

/// Tree of procedures.
pub struct Router<C> {
    nodes: BTreeMap<String, Node<C>>,
    problems: Vec<RouterError>,
}

impl<C> Default for Router<C> {
    fn default() -> Self {
        Router {
            nodes: BTreeMap::new(),
            problems: Vec::new(),
        }
    }
}

impl<C> fmt::Debug for Router<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("paths", &self.paths())
            .finish()
    }
}

fn decode<I: DeserializeOwned>(input: Value) -> Result<I, BoxError> {
    serde_json::from_value(input)
        .map_err(|e| Box::new(RpcError::bad_request(format!("invalid input: {e}"))) as BoxError)
}

fn encode<O: Serialize>(output: O) -> Result<Value, BoxError> {
    serde_json::to_value(output).map_err(|e| {
        Box::new(RpcError::internal(format!("failed to serialize output: {e}"))) as BoxError
    })
}

impl<C: 'static> Router<C> {
    pub fn new() -> Self {
        Router::default()
    }

    /// Register a typed query.
    pub fn query<I, O, E, F>(self, name: &str, f: F) -> Self
    where
        I: DeserializeOwned,
        O: Serialize,
        E: Into<BoxError>,
        F: Fn(&C, I) -> Result<O, E> + Send + Sync + 'static,
    {
        self.procedure(
            name,
            Procedure::query(move |ctx, input| {
                let output = f(ctx, decode(input)?).map_err(Into::<BoxError>::into)?;
                encode(output)
            }),
        )
    }

    /// Register a typed mutation.
    pub fn mutation<I, O, E, F>(self, name: &str, f: F) -> Self
    where
        I: DeserializeOwned,
        O: Serialize,
        E: Into<BoxError>,
        F: Fn(&C, I) -> Result<O, E> + Send + Sync + 'static,
    {
        self.procedure(
            name,
            Procedure::mutation(move |ctx, input| {
                let output = f(ctx, decode(input)?).map_err(Into::<BoxError>::into)?;
                encode(output)
            }),
        )
    }

    /// Register a typed subscription.
    pub fn subscription<I, E, F>(self, name: &str, f: F) -> Self
    where
        I: DeserializeOwned,
        E: Into<BoxError>,
        F: Fn(&C, I) -> Result<Observable, E> + Send + Sync + 'static,
    {
        self.procedure(
            name,
            Procedure::subscription(move |ctx, input| f(ctx, decode(input)?).map_err(Into::into)),
        )
    }

    /// Register an untyped procedure.
    pub fn procedure(mut self, name: &str, procedure: Procedure<C>) -> Self {
        self.insert(name, Node::Procedure(procedure));
        self
    }

    /// Mount a sub tree under `name`.
    pub fn nest(mut self, name: &str, router: Router<C>) -> Self {
        let prefixed = router.problems.iter().map(|p| match p {
            RouterError::InvalidName(n) => RouterError::InvalidName(format!("{name}.{n}")),
            RouterError::Duplicate(n) => RouterError::Duplicate(format!("{name}.{n}")),
        });
        self.problems.extend(prefixed.collect::<Vec<_>>());
        self.insert(name, Node::Router(router));
        self
    }

    fn insert(&mut self, name: &str, node: Node<C>) {
        if name.is_empty() || name.contains('.') {
            self.problems.push(RouterError::InvalidName(name.to_owned()));
            return;
        }
        if self.nodes.contains_key(name) {
            self.problems.push(RouterError::Duplicate(name.to_owned()));
            return;
        }
        self.nodes.insert(name.to_owned(), node);
    }
}

impl<C> Router<C> {
    /// First problem recorded while building, if any.
    pub fn validate(&self) -> Result<(), RouterError> {
        match self.problems.first() {
            Some(problem) => Err(problem.clone()),
            None => Ok(()),
        }
    }

    /// Walk `path` to its procedure.
    ///
    /// A missing segment yields `NOT_FOUND` naming the full path and the
    /// first segment that could not be resolved.
    pub fn resolve(&self, path: &str) -> Result<&Procedure<C>, RpcError> {
        let mut segments = path.split('.');
        let mut router = self;
        while let Some(segment) = segments.next() {
            match router.nodes.get(segment) {
                Some(Node::Router(r)) => router = r,
                Some(Node::Procedure(p)) => {
                    return match segments.next() {
                        None => Ok(p),
                        Some(extra) => Err(RpcError::not_found(path, extra)),
                    };
                }
                None => return Err(RpcError::not_found(path, segment)),
            }
        }
        Err(RpcError::new(
            ErrorCode::NotFound,
            format!("No procedure found on path \"{path}\" (it names a router)"),
        )
        .with_path(path))
    }

    /// Resolve `path` and check that it can be invoked with `method`.
    pub fn resolve_for(&self, path: &str, method: Method) -> Result<&Procedure<C>, RpcError> {
        let procedure = self.resolve(path)?;
        if procedure.kind().method() != method {
            return Err(RpcError::new(
                ErrorCode::MethodNotSupported,
                format!(
                    "No \"{}\" procedure on path \"{path}\", it is a {:?}",
                    method.as_str(),
                    procedure.kind()
                ),
            )
            .with_path(path));
        }
        Ok(procedure)
    }

    /// All procedure paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, node) in &self.nodes {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            match node {
                Node::Router(r) => r.collect_paths(&path, out),
                Node::Procedure(_) => out.push(path),
            }
        }
    }
}
