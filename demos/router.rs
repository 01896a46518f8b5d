//! A small router application served through the loopback transport.
//! Demonstrates wiring a listener and pump together, routing with `matchit`
//! and a clean drain on shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::http::{Response, StatusCode};
use kaccept::{
    Application, BoxError, Listener, ListenerOptions, LoopbackRequest, LoopbackTransport, Pump,
    RequestContext, ServerConfig,
};
use matchit::{Params, Router};

/// A route handler: gets the path parameters and returns the body.
type Handler = Box<dyn Fn(&Params) -> String + Send + Sync>;

/// Routes requests with `matchit` and keeps a shared visit counter.
struct RouterApp {
    router: Router<Handler>,
}

impl RouterApp {
    /// Creates the router with the following routes:
    /// - GET "/" - Returns a welcome message
    /// - GET "/hello/:name" - Returns a personalized greeting
    /// - GET "/counter" - Returns and increments a shared counter
    fn new() -> Result<Self, matchit::InsertError> {
        let mut router = Router::new();
        let counter = Arc::new(AtomicUsize::new(0));

        router.insert("/", Box::new(|_: &Params| "Welcome to kaccept!".to_owned()) as Handler)?;

        router.insert(
            "/hello/:name",
            Box::new(|params: &Params| format!("Hello, {}!", params.get("name").unwrap_or("world"))) as Handler,
        )?;

        router.insert(
            "/counter",
            Box::new(move |_: &Params| format!("Counter: {}", counter.fetch_add(1, Ordering::SeqCst) + 1)) as Handler,
        )?;

        Ok(Self { router })
    }
}

#[async_trait]
impl Application for RouterApp {
    type Context = ();

    fn create_context(&self, _request: &RequestContext) {}

    async fn process_request(&self, _: &mut (), request: &mut RequestContext) -> Result<(), BoxError> {
        let head = request.head()?;
        match self.router.at(head.uri.path()) {
            Ok(matched) => {
                let body = (matched.value)(&matched.params);
                request.respond(Response::new(Bytes::from(body)))?;
            }
            Err(_) => request.respond_status(StatusCode::NOT_FOUND)?,
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    pretty_env_logger::init();

    let config = ServerConfig::new()?;
    let transport = Arc::new(LoopbackTransport::new()?);
    let listener = Arc::new(Listener::new(transport.clone(), ListenerOptions::from(&config)));
    let pump = Pump::from_config(listener, &config);
    pump.start(RouterApp::new()?)?;

    let base = config
        .url_prefixes
        .first()
        .map(|prefix| prefix.trim_end_matches('/').replace(['+', '*'], "localhost"))
        .ok_or("no url prefix configured")?;
    let paths = ["/", "/hello/your-name", "/counter", "/counter", "/missing"];
    for path in paths {
        transport.submit(LoopbackRequest::get(format!("{}{}", base, path)))?;
    }

    while transport.sent_responses().len() < paths.len() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut responses = transport.sent_responses();
    responses.sort_by_key(|sent| sent.request_id);
    for (path, sent) in paths.iter().zip(&responses) {
        println!(
            "{:<18} {} {}",
            path,
            sent.status_line(),
            String::from_utf8_lossy(&sent.body)
        );
    }

    let outcome = pump.shutdown().await?;
    println!("Shutdown: {:?}", outcome);
    Ok(())
}
