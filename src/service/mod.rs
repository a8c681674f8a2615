//! C2: service registration and reflection-free dispatch.
//!
//! The original tutorial builds `argType`/`replyType` and an invocation
//! trampoline per method at registration time using runtime reflection
//! over a receiver's methods. Rust has no equivalent of that reflection,
//! so admission becomes a static check performed once, when a method is
//! registered, and dispatch goes through a small value-variant design:
//! each registered method is wrapped in a [`TypedMethod`] that knows its
//! own `Args`/`Reply` types, stored behind the object-safe [`ErasedMethod`]
//! trait so a `Service` can hold a heterogeneous map of them. The pattern
//! is the same type-erasure-via-`PhantomData` shape used by handler
//! registries in other async RPC crates.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::WireCodec;
use crate::error::{Error, Result};

/// `true` iff `name`'s first character is uppercase ASCII — the same
/// "exported" predicate the source language uses to decide what is
/// reachable from remote callers.
pub(crate) fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

#[async_trait]
pub(crate) trait ErasedMethod<Cod: WireCodec>: Send + Sync {
    async fn call(&self, body: &[u8], codec: &Cod) -> Result<Vec<u8>>;
    fn num_calls(&self) -> u64;
}

/// One admitted method: a receiver, the async function invoking it, and
/// the atomic call counter the original tracks per `MethodType`.
struct TypedMethod<S, Args, Reply, Cod, F, Fut> {
    receiver: Arc<S>,
    func: F,
    num_calls: AtomicU64,
    _marker: PhantomData<fn(Args) -> (Reply, Cod, Fut)>,
}

impl<S, Args, Reply, Cod, F, Fut> TypedMethod<S, Args, Reply, Cod, F, Fut>
where
    S: Send + Sync + 'static,
    Args: DeserializeOwned + Send + 'static,
    Reply: Serialize + Send + 'static,
    Cod: WireCodec,
    F: Fn(Arc<S>, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply>> + Send + 'static,
{
    fn new(receiver: Arc<S>, func: F) -> Self {
        TypedMethod {
            receiver,
            func,
            num_calls: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<S, Args, Reply, Cod, F, Fut> ErasedMethod<Cod> for TypedMethod<S, Args, Reply, Cod, F, Fut>
where
    S: Send + Sync + 'static,
    Args: DeserializeOwned + Send + 'static,
    Reply: Serialize + Send + 'static,
    Cod: WireCodec,
    F: Fn(Arc<S>, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply>> + Send + 'static,
{
    async fn call(&self, body: &[u8], codec: &Cod) -> Result<Vec<u8>> {
        // Incremented before invocation, matching the original's
        // `atomic.AddUint64(&m.numCalls, 1)` ahead of the call itself.
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        let args: Args = codec.decode(body)?;
        let reply = (self.func)(self.receiver.clone(), args).await?;
        codec.encode(&reply)
    }

    fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }
}

/// A registered receiver plus its admitted methods, addressable as
/// `"<name>.<method>"`.
pub struct Service<Cod: WireCodec> {
    pub(crate) name: String,
    pub(crate) methods: HashMap<String, Box<dyn ErasedMethod<Cod>>>,
}

impl<Cod: WireCodec> std::fmt::Debug for Service<Cod> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Cod: WireCodec> Service<Cod> {
    pub(crate) async fn call(&self, method: &str, body: &[u8], codec: &Cod) -> Result<Vec<u8>> {
        let m = self
            .methods
            .get(method)
            .ok_or_else(|| Error::UnknownMethod(format!("{}.{}", self.name, method)))?;
        m.call(body, codec).await
    }

    /// Number of times `method` has been invoked, or `None` if it was
    /// never registered.
    pub fn num_calls(&self, method: &str) -> Option<u64> {
        self.methods.get(method).map(|m| m.num_calls())
    }
}

/// Builds a [`Service`] one admitted method at a time.
///
/// ```ignore
/// let calc = Arc::new(Calc);
/// let service = ServiceBuilder::new("Calc")?
///     .method("Sum", calc, |calc, args: SumArgs| async move { calc.sum(args) })?
///     .build();
/// ```
pub struct ServiceBuilder<Cod: WireCodec> {
    name: String,
    methods: HashMap<String, Box<dyn ErasedMethod<Cod>>>,
}

impl<Cod: WireCodec> std::fmt::Debug for ServiceBuilder<Cod> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Cod: WireCodec> ServiceBuilder<Cod> {
    /// Starts a new service named `name`. Fails if `name` is not
    /// exported (does not start with an uppercase letter) — the same
    /// predicate the original applies to the receiver's type name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_exported(&name) {
            return Err(Error::NotExported(name));
        }
        Ok(ServiceBuilder {
            name,
            methods: HashMap::new(),
        })
    }

    /// Admits `method_name` as a callable method backed by `func`,
    /// invoked against `receiver`. Fails if `method_name` is not
    /// exported.
    pub fn method<S, Args, Reply, F, Fut>(
        mut self,
        method_name: impl Into<String>,
        receiver: Arc<S>,
        func: F,
    ) -> Result<Self>
    where
        S: Send + Sync + 'static,
        Args: DeserializeOwned + Send + 'static,
        Reply: Serialize + Send + 'static,
        F: Fn(Arc<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        let method_name = method_name.into();
        if !is_exported(&method_name) {
            return Err(Error::NotExported(method_name));
        }
        self.methods
            .insert(method_name, Box::new(TypedMethod::new(receiver, func)));
        Ok(self)
    }

    /// Finishes construction.
    pub fn build(self) -> Service<Cod> {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// The server's `services: name -> Service` map. Read-mostly: lookups
/// happen on every dispatched request, registration happens a handful of
/// times at startup.
pub(crate) struct ServiceMap<Cod: WireCodec> {
    services: std::sync::RwLock<HashMap<String, Arc<Service<Cod>>>>,
}

impl<Cod: WireCodec> Default for ServiceMap<Cod> {
    fn default() -> Self {
        ServiceMap {
            services: std::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl<Cod: WireCodec> ServiceMap<Cod> {
    pub(crate) fn register(&self, service: Service<Cod>) -> Result<()> {
        let mut services = self.services.write().unwrap();
        if services.contains_key(&service.name) {
            return Err(Error::DuplicateService(service.name));
        }
        services.insert(service.name.clone(), Arc::new(service));
        Ok(())
    }

    /// Splits `service_method` on the *last* `.` into `(service, method)`
    /// and looks up the service. Service names may not contain `.`;
    /// method names are not restricted by this parser.
    pub(crate) fn find(&self, service_method: &str) -> Result<(Arc<Service<Cod>>, String)> {
        let dot = service_method
            .rfind('.')
            .ok_or_else(|| Error::IllFormedServiceMethod(service_method.to_string()))?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);
        let services = self.services.read().unwrap();
        let service = services
            .get(service_name)
            .cloned()
            .ok_or_else(|| Error::UnknownService(service_name.to_string()))?;
        Ok((service, method_name.to_string()))
    }
}
