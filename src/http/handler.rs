//! Handler abstraction shared by the retry middleware and the forwarder.
//!
//! A handler writes its response incrementally into a [`ResponseSink`]
//! instead of returning a finished `Response`. This is what lets the retry
//! middleware slip a buffering recorder between the handler and the client.

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use futures_util::future::BoxFuture;

use crate::http::sink::ResponseSink;

/// Something that can serve an HTTP request into a response sink.
pub trait Handler: Send + Sync + 'static {
    /// Serve `request`, writing the response into `sink`.
    ///
    /// The returned future must not complete before every task it spawned
    /// that may touch the request extensions has finished.
    fn serve<'a>(
        &'a self,
        request: Request<Body>,
        sink: &'a mut dyn ResponseSink,
    ) -> BoxFuture<'a, ()>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn serve<'a>(
        &'a self,
        request: Request<Body>,
        sink: &'a mut dyn ResponseSink,
    ) -> BoxFuture<'a, ()> {
        (**self).serve(request, sink)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn serve<'a>(
        &'a self,
        request: Request<Body>,
        sink: &'a mut dyn ResponseSink,
    ) -> BoxFuture<'a, ()> {
        (**self).serve(request, sink)
    }
}
