//! Service registry: local method handlers and event subscriptions.
//!
//! Handlers are typed at registration time: arguments are deserialized and
//! return values serialized by a wrapper, so the dispatcher only ever sees
//! the type-erased [`MethodHandler`]/[`EventHandler`] traits. Both maps are
//! behind `RwLock`s because the embedding application may keep registering
//! while the read loop is already delivering messages.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::error::{ClientError, Result};
use crate::protocol::ErrorKind;

/// Boxed future returned by type-erased handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure returned by a method handler or subscriber, carried back to the
/// remote caller (methods) or logged (subscribers).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Outcome of a type-erased method invocation: encoded reply payload, or
/// the error kind and message to put in the error reply.
pub type ErasedMethodOutcome = std::result::Result<Option<Vec<u8>>, (ErrorKind, String)>;

/// Type-erased method handler.
pub trait MethodHandler: Send + Sync {
    fn call(&self, data: Option<Bytes>) -> BoxFuture<'static, ErasedMethodOutcome>;
}

/// Type-erased event subscriber.
pub trait EventHandler: Send + Sync {
    fn call(&self, data: Option<Bytes>) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// Wrapper deserializing arguments and serializing the return value around
/// a typed method closure.
struct TypedMethod<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> MethodHandler for TypedMethod<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
{
    fn call(&self, data: Option<Bytes>) -> BoxFuture<'static, ErasedMethodOutcome> {
        let args: T = match decode_args(data.as_deref()) {
            Ok(v) => v,
            Err(e) => {
                return Box::pin(async move { Err((ErrorKind::BadArguments, e.to_string())) })
            }
        };

        let fut = (self.handler)(args);
        Box::pin(async move {
            match fut.await {
                Ok(value) => match codec::encode(&value) {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) => Err((ErrorKind::Handler, format!("reply encoding failed: {e}"))),
                },
                Err(HandlerError(message)) => Err((ErrorKind::Handler, message)),
            }
        })
    }
}

struct TypedSubscriber<F, T, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> EventHandler for TypedSubscriber<F, T, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn call(&self, data: Option<Bytes>) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let args: T = match decode_args(data.as_deref()) {
            Ok(v) => v,
            Err(e) => {
                return Box::pin(async move {
                    Err(HandlerError(format!("event payload decoding failed: {e}")))
                })
            }
        };

        Box::pin((self.handler)(args))
    }
}

/// Absent payloads decode as MessagePack nil, so nullary handlers can take
/// `()` or `Option<T>`.
fn decode_args<T: DeserializeOwned>(data: Option<&[u8]>) -> Result<T> {
    match data {
        Some(bytes) => codec::decode(bytes),
        None => codec::decode(&[0xc0]),
    }
}

/// Mapping from (service, method) to handlers and event name to subscribers.
pub struct ServiceRegistry {
    methods: RwLock<HashMap<(String, String), Arc<dyn MethodHandler>>>,
    subscriptions: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a method handler for (service, method).
    ///
    /// A duplicate registration is rejected: replacing a live handler is
    /// almost always a configuration mistake, and rejecting surfaces it at
    /// startup.
    ///
    /// Returns `true` when this is the first method of `service`, i.e. the
    /// broker has not been told about the service yet.
    pub fn register_method<F, T, R, Fut>(
        &self,
        service: &str,
        method: &str,
        handler: F,
    ) -> Result<bool>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);

        let key = (service.to_string(), method.to_string());
        if methods.contains_key(&key) {
            return Err(ClientError::DuplicateMethod {
                service: service.to_string(),
                method: method.to_string(),
            });
        }

        let service_is_new = !methods.keys().any(|(s, _)| s == service);
        methods.insert(
            key,
            Arc::new(TypedMethod {
                handler,
                _phantom: PhantomData,
            }),
        );
        Ok(service_is_new)
    }

    /// Add a subscriber for an event. Many subscribers per event are fine.
    ///
    /// Returns `true` when this is the first local subscriber for `event`,
    /// i.e. the broker has not been asked to deliver it yet.
    pub fn subscribe<F, T, Fut>(&self, event: &str, handler: F) -> bool
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let handlers = subscriptions.entry(event.to_string()).or_default();
        handlers.push(Arc::new(TypedSubscriber {
            handler,
            _phantom: PhantomData,
        }));
        handlers.len() == 1
    }

    /// Look up the handler for (service, method).
    pub fn lookup_method(&self, service: &str, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(service.to_string(), method.to_string()))
            .cloned()
    }

    /// Snapshot of the subscribers for an event.
    pub fn subscribers(&self, event: &str) -> Vec<Arc<dyn EventHandler>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    /// Service names registered so far.
    pub fn service_names(&self) -> Vec<String> {
        let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = methods.keys().map(|(s, _)| s.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Event names with at least one local subscriber.
    pub fn event_names(&self) -> Vec<String> {
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = subscriptions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
