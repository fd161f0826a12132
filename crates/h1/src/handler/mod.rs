//! The application seam.
//!
//! A [`Handler`] gets the [`RequestContext`] of one request. It reads the body and writes the
//! response through the context; what it leaves unfinished is completed by the connection.
//! Returning an error turns into a `500`, or a `4xx` when the error came from a malformed
//! request, as long as the response has not started.
//!
//! ```no_run
//! use micro_h1::connection::RequestContext;
//! use micro_h1::handler::make_handler;
//!
//! let handler = make_handler(|ctx: &mut RequestContext| {
//!     Box::pin(async move {
//!         let body = ctx.body().read_to_end().await?;
//!         ctx.response().write(&body).await?;
//!         Ok(())
//!     })
//! });
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::connection::RequestContext;
use crate::protocol::BoxError;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &mut RequestContext) -> Result<(), BoxError>;
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync,
{
    async fn call(&self, ctx: &mut RequestContext) -> Result<(), BoxError> {
        (self.f)(ctx).await
    }
}

pub fn make_handler<F>(f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync,
{
    HandlerFn { f }
}
