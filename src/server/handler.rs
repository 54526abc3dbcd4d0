// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Service;

use crate::controller::Controller;

#[derive(Clone)]
pub struct RequestHandler {
    controller: Arc<Controller>,
    peer: Option<SocketAddr>,
}

impl RequestHandler {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self {
            controller,
            peer: None,
        }
    }

    /// Stamps the accepted connection's peer address so forwarded requests
    /// can carry `x-forwarded-for`.
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let controller = self.controller.clone();
        let peer = self.peer;
        Box::pin(async move { Ok(controller.handle(req, peer).await) })
    }
}
