use crate::transport::{Publication, RawPayload};
use std::{future::Future, pin::Pin};
use tower::{Layer, Service};

/// Tower `Service` wrapper that serializes payloads to JSON.
///
/// Converts any payload type `M` implementing `serde::Serialize` into a
/// `RawPayload` of JSON bytes before passing the publication to the inner
/// service. Headers and correlation token pass through untouched, so the
/// bytes on the wire match the fixed `application/json` content type.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, M> Service<Publication<M>> for JsonService<T>
where
    M: serde::Serialize + Send + 'static,
    T: Service<Publication<RawPayload>> + Clone + Send + 'static,
    <T as Service<Publication<RawPayload>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Publication<M>) -> Self::Future {
        // Take the readied service and leave a fresh clone in its place.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let bytes = serde_json::to_vec(&req.envelope.message)
                .map_err(|e| -> tower::BoxError { Box::new(e) })?;
            let publication = req.map_message(|_| RawPayload(bytes));

            inner.call(publication).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies [`JsonService`] to a service stack.
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}
