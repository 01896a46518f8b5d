//! An accepted request handed to the application.

use std::fmt;
use std::sync::Arc;

use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH};
use hyper::http::request::Parts;
use hyper::http::{Request, Response, StatusCode, Version};

use crate::buffer::{NativeRequestBuffer, NativeRequestHeader};
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::transport::{AuthScheme, ConnectionId, NativeResponse, RequestId};

/// One request received from the kernel queue.
///
/// Owns the buffer the kernel wrote the request into until the request is
/// released or dropped. A request must be answered with
/// [`respond`](RequestContext::respond) or [`abort`](RequestContext::abort);
/// one dropped without either is cancelled so the connection is not left
/// hanging.
pub struct RequestContext {
    listener: Arc<Listener>,
    header: NativeRequestHeader,
    buffer: Option<NativeRequestBuffer>,
    completed: bool,
}

impl RequestContext {
    pub(crate) fn new(listener: Arc<Listener>, buffer: NativeRequestBuffer) -> Self {
        Self {
            listener,
            header: *buffer.header(),
            buffer: Some(buffer),
            completed: false,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.header.request_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.header.connection_id
    }

    /// Index of the url prefix this request was routed through.
    pub fn url_context(&self) -> u64 {
        self.header.url_context
    }

    /// Headers the kernel did not recognise.
    pub fn unknown_header_count(&self) -> usize {
        usize::from(self.header.unknown_header_count)
    }

    pub fn is_authenticated(&self) -> bool {
        self.header.authenticated
    }

    /// Size of the buffer still held, `None` once released.
    pub fn buffer_size(&self) -> Option<usize> {
        self.buffer.as_ref().map(NativeRequestBuffer::size)
    }

    /// Raw request head as the kernel wrote it. Empty once released.
    pub fn raw_head(&self) -> &[u8] {
        self.buffer.as_ref().map(NativeRequestBuffer::data).unwrap_or(&[])
    }

    /// Parses the request line and headers.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRequest`] when the head does not parse and
    /// [`Error::IncompleteRequest`] when it is cut short.
    pub fn head(&self) -> Result<Parts> {
        let data = self.raw_head();
        // one LF per line, CR optional
        let lines = data.iter().filter(|&&byte| byte == b'\n').count();
        let mut headers = vec![httparse::EMPTY_HEADER; lines.max(1)];
        let mut parsed = httparse::Request::new(&mut headers);

        if parsed.parse(data)?.is_partial() {
            return Err(Error::IncompleteRequest);
        }

        let method = parsed.method.ok_or(Error::IncompleteRequest)?;
        let path = parsed.path.ok_or(Error::IncompleteRequest)?;
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut builder = Request::builder().method(method).uri(path).version(version);
        for header in parsed.headers.iter() {
            builder = builder.header(header.name, header.value);
        }
        let (parts, ()) = builder.body(())?.into_parts();
        Ok(parts)
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Sends `response` and completes the request.
    ///
    /// # Errors
    /// Returns [`Error::RequestCompleted`] if the request was already
    /// answered or aborted, or the transport error if the send fails.
    pub fn respond(&mut self, response: Response<Bytes>) -> Result<()> {
        self.ensure_open()?;
        self.completed = true;

        let (parts, body) = response.into_parts();
        let response = NativeResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        };
        self.listener.send_response(self.request_id(), &response)
    }

    /// Sends an empty response with `status`.
    pub fn respond_status(&mut self, status: StatusCode) -> Result<()> {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        self.respond(response)
    }

    /// Resets the connection without responding.
    pub fn abort(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Err(err) = self.listener.cancel_request(self.request_id()) {
            log::debug!("Failed to cancel request {}: {}", self.request_id(), err);
        }
    }

    /// Gives the request buffer back early. Metadata stays readable.
    pub fn release(&mut self) {
        self.buffer = None;
    }

    /// Answers with a bodyless error status on the listener's behalf.
    pub(crate) fn reject(&mut self, status: StatusCode, challenges: &[AuthScheme]) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.listener.send_error(self.request_id(), status, challenges);
        self.release();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.completed {
            Err(Error::RequestCompleted(self.request_id()))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.header.request_id)
            .field("connection_id", &self.header.connection_id)
            .field("url_context", &self.header.url_context)
            .field("completed", &self.completed)
            .finish()
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.completed {
            log::debug!("Request {} dropped without a response, cancelling", self.request_id());
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::listener::ListenerOptions;
    use crate::testing::ScriptedTransport;

    fn request(transport: &Arc<ScriptedTransport>, id: RequestId, head: &[u8]) -> RequestContext {
        let listener = Arc::new(Listener::new(transport.clone(), ListenerOptions::default()));
        listener.start().unwrap();

        let mut buffer = BufferPool::new().acquire(head.len().max(1));
        let header = NativeRequestHeader {
            request_id: id,
            connection_id: 40 + id,
            url_context: 1,
            unknown_header_count: 2,
            authenticated: true,
        };
        buffer.fill(header, head).unwrap();
        RequestContext::new(listener, buffer)
    }

    /// Tests that the head parses into request parts.
    #[test]
    fn test_head_parsing() {
        let transport = ScriptedTransport::new();
        let mut request = request(
            &transport,
            1,
            b"POST /items?id=3 HTTP/1.0\r\nHost: example\r\nX-Trace: a\r\nX-Trace: b\r\n\r\n",
        );

        let head = request.head().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.uri.path(), "/items");
        assert_eq!(head.uri.query(), Some("id=3"));
        assert_eq!(head.version, Version::HTTP_10);
        assert_eq!(head.headers.get_all("x-trace").iter().count(), 2);

        assert_eq!(request.connection_id(), 41);
        assert_eq!(request.url_context(), 1);
        assert_eq!(request.unknown_header_count(), 2);
        assert!(request.is_authenticated());
        request.abort();
    }

    /// Tests a head with bare LF line endings and several headers.
    #[test]
    fn test_head_with_bare_line_feeds() {
        let transport = ScriptedTransport::new();
        let mut request = request(&transport, 2, b"GET /lf HTTP/1.1\nHost: a\nX-One: 1\nX-Two: 2\n\n");

        let head = request.head().unwrap();
        assert_eq!(head.uri.path(), "/lf");
        assert_eq!(head.headers.len(), 3);
        assert_eq!(head.headers["x-two"], "2");
        request.abort();
    }

    #[test]
    fn test_incomplete_head() {
        let transport = ScriptedTransport::new();
        let mut request = request(&transport, 1, b"GET / HTTP/1.1\r\nHost: a\r\n");
        assert!(matches!(request.head(), Err(Error::IncompleteRequest)));
        request.abort();
    }

    /// Tests that a request answers once and reports later attempts.
    #[test]
    fn test_respond_once() {
        let transport = ScriptedTransport::new();
        let mut request = request(&transport, 5, b"GET / HTTP/1.1\r\n\r\n");

        request
            .respond(Response::new(Bytes::from_static(b"hello")))
            .unwrap();
        assert!(request.is_completed());
        assert!(matches!(
            request.respond_status(StatusCode::OK),
            Err(Error::RequestCompleted(5))
        ));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 5);
        assert_eq!(sent[0].1.body, Bytes::from_static(b"hello"));

        drop(request);
        assert!(transport.cancelled().is_empty());
    }

    /// Tests that an unanswered request is cancelled when dropped.
    #[test]
    fn test_drop_cancels() {
        let transport = ScriptedTransport::new();
        let request = request(&transport, 8, b"GET / HTTP/1.1\r\n\r\n");
        drop(request);
        assert_eq!(transport.cancelled(), vec![8]);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_release_keeps_metadata() {
        let transport = ScriptedTransport::new();
        let mut request = request(&transport, 4, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(request.buffer_size(), Some(18));

        request.release();
        assert_eq!(request.buffer_size(), None);
        assert!(request.raw_head().is_empty());
        assert_eq!(request.request_id(), 4);
        request.abort();
        assert_eq!(transport.cancelled(), vec![4]);
    }
}
