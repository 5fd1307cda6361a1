//! Routes decoded messages from the read loop.
//!
//! Replies complete their tracker waiter. Requests and publishes run their
//! handlers on spawned tasks so a slow or failing handler can never stall
//! frame delivery; `dispatch` itself returns without awaiting application
//! code. Exactly one reply goes out per incoming request, whatever happens
//! inside the handler.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::protocol::{ErrorKind, Message, Publish, Reply, Request};
use crate::registry::ServiceRegistry;
use crate::tracker::RequestTracker;
use crate::writer::WriterHandle;

pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    tracker: Arc<RequestTracker>,
    writer: WriterHandle,
    /// Bounds concurrently running method handlers.
    handler_permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        tracker: Arc<RequestTracker>,
        writer: WriterHandle,
        max_concurrent_handlers: usize,
    ) -> Self {
        Self {
            registry,
            tracker,
            writer,
            handler_permits: Arc::new(Semaphore::new(max_concurrent_handlers)),
        }
    }

    /// Route one decoded message. Never blocks on handlers or the writer.
    pub fn dispatch(&self, message: Message) {
        match message {
            Message::Reply(reply) => self.tracker.complete(reply.id, reply.outcome),
            Message::Request(request) => self.dispatch_request(request),
            Message::Publish(publish) => self.dispatch_publish(publish),
            Message::Register(_) | Message::Subscribe(_) => {
                // Client-to-broker messages; the broker never sends these.
                tracing::warn!("dropping unexpected client-bound message from broker");
            }
        }
    }

    fn dispatch_request(&self, request: Request) {
        let Request {
            id,
            service,
            method,
            data,
            ..
        } = request;

        let Some(handler) = self.registry.lookup_method(&service, &method) else {
            tracing::warn!(%service, %method, id, "request for unregistered method");
            self.send_reply(Reply::error(
                id,
                ErrorKind::MethodNotFound,
                format!("no such method: {service}.{method}"),
            ));
            return;
        };

        let permit = match self.handler_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // The request still gets its one reply, as an error.
                tracing::warn!(%service, %method, id, "handler capacity exhausted");
                self.send_reply(Reply::error(
                    id,
                    ErrorKind::Handler,
                    "handler capacity exhausted",
                ));
                return;
            }
        };

        let writer = self.writer.clone();
        let payload = data.map(|b| bytes::Bytes::from(b.into_vec()));

        tokio::spawn(async move {
            let _permit = permit;

            let reply = match handler.call(payload).await {
                Ok(result) => Reply::success(id, result),
                Err((kind, message)) => {
                    tracing::debug!(%service, %method, id, %message, "handler returned error");
                    Reply::error(id, kind, message)
                }
            };

            if let Err(e) = writer.send_message(&Message::Reply(reply)).await {
                tracing::warn!(id, "could not send reply: {e}");
            }
        });
    }

    fn dispatch_publish(&self, publish: Publish) {
        let subscribers = self.registry.subscribers(&publish.event);
        if subscribers.is_empty() {
            tracing::debug!(event = %publish.event, "publish with no local subscribers");
            return;
        }

        let payload = publish.data.map(|b| bytes::Bytes::from(b.into_vec()));

        for subscriber in subscribers {
            let event = publish.event.clone();
            let payload = payload.clone();
            // Each subscriber runs independently; one failing never
            // suppresses the others.
            tokio::spawn(async move {
                if let Err(e) = subscriber.call(payload).await {
                    tracing::warn!(%event, "subscriber failed: {e}");
                }
            });
        }
    }

    fn send_reply(&self, reply: Reply) {
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let id = reply.id;
            if let Err(e) = writer.send_message(&Message::Reply(reply)).await {
                tracing::warn!(id, "could not send reply: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt};

    use crate::codec;
    use crate::protocol::{FrameDecoder, ReplyOutcome, DEFAULT_MAX_FRAME_SIZE};
    use crate::registry::HandlerError;
    use crate::writer::spawn_writer_task;

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<ServiceRegistry>,
        tracker: Arc<RequestTracker>,
        server: tokio::io::DuplexStream,
    }

    fn fixture() -> Fixture {
        let (client, server) = duplex(64 * 1024);
        let (writer, _task) = spawn_writer_task(client, 64, DEFAULT_MAX_FRAME_SIZE);
        let registry = Arc::new(ServiceRegistry::new());
        let tracker = Arc::new(RequestTracker::new());
        let dispatcher = Dispatcher::new(registry.clone(), tracker.clone(), writer, 16);
        Fixture {
            dispatcher,
            registry,
            tracker,
            server,
        }
    }

    async fn read_one_message(server: &mut tokio::io::DuplexStream) -> Message {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed before a frame arrived");
            let mut payloads = decoder.push(&buf[..n]).unwrap();
            if let Some(payload) = payloads.pop() {
                return codec::decode(&payload).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_request_produces_one_success_reply() {
        let mut fx = fixture();
        fx.registry
            .register_method("led", "blink", |_: ()| async { Ok("ok") })
            .unwrap();

        fx.dispatcher
            .dispatch(Message::Request(Request::new(77, "led", "blink", None)));

        match read_one_message(&mut fx.server).await {
            Message::Reply(reply) => {
                assert_eq!(reply.id, 77);
                match reply.outcome {
                    ReplyOutcome::Success { data } => {
                        let value: String = codec::decode(data.as_ref().unwrap()).unwrap();
                        assert_eq!(value, "ok");
                    }
                    other => panic!("expected success, got {other:?}"),
                }
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_method_gets_method_not_found() {
        let mut fx = fixture();

        fx.dispatcher
            .dispatch(Message::Request(Request::new(5, "led", "blink", None)));

        match read_one_message(&mut fx.server).await {
            Message::Reply(reply) => {
                assert_eq!(reply.id, 5);
                assert!(matches!(
                    reply.outcome,
                    ReplyOutcome::Error {
                        kind: ErrorKind::MethodNotFound,
                        ..
                    }
                ));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_failure_is_contained_in_error_reply() {
        let mut fx = fixture();
        fx.registry
            .register_method("motor", "move", |_: i32| async {
                Err::<(), _>(HandlerError::from("jammed"))
            })
            .unwrap();

        let args = codec::encode(&10i32).unwrap();
        fx.dispatcher.dispatch(Message::Request(Request::new(
            8,
            "motor",
            "move",
            Some(args),
        )));

        match read_one_message(&mut fx.server).await {
            Message::Reply(reply) => match reply.outcome {
                ReplyOutcome::Error { kind, message } => {
                    assert_eq!(kind, ErrorKind::Handler);
                    assert_eq!(message, "jammed");
                }
                other => panic!("expected error, got {other:?}"),
            },
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reply_completes_tracker_waiter() {
        let fx = fixture();
        let (id, rx) = fx.tracker.register();

        fx.dispatcher
            .dispatch(Message::Reply(Reply::success(id, None)));

        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_despite_one_failing() {
        let fx = fixture();
        let invoked = Arc::new(AtomicU32::new(0));

        let counter = invoked.clone();
        fx.registry.subscribe("match_start", move |_: ()| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::from("subscriber one exploded"))
            }
        });

        let counter = invoked.clone();
        fx.registry.subscribe("match_start", move |_: ()| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        fx.dispatcher
            .dispatch(Message::Publish(Publish::new("match_start", None)));

        // Subscribers run on spawned tasks; give them a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(invoked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ignored() {
        let fx = fixture();
        fx.dispatcher
            .dispatch(Message::Publish(Publish::new("nobody_home", None)));
        // Nothing to assert beyond "does not panic or write".
        assert_eq!(fx.tracker.pending_count(), 0);
    }
}
