//! Shared helpers for backend tests: a throwaway HTTP server that records
//! every request it sees.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Response, StatusCode, Uri};
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub body: String,
}

pub type Responder = dyn Fn(&Method, &str, &str) -> (StatusCode, String) + Send + Sync;

#[derive(Clone)]
pub struct FakeServer {
    pub base_url: String,
    pub requests: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeServer {
    pub fn recorded(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> Vec<Recorded> {
        self.recorded()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }
}

struct ServerState {
    requests: Arc<Mutex<Vec<Recorded>>>,
    respond: Box<Responder>,
}

async fn handle(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    body: String,
) -> Response<Body> {
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or_default().to_string();

    state.requests.lock().unwrap().push(Recorded {
        method: method.clone(),
        path: path.clone(),
        query,
        body: body.clone(),
    });

    let (status, text) = (state.respond)(&method, &path, &body);
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(text))
        .unwrap()
}

/// Serve `respond` on an ephemeral port until the test ends.
pub async fn spawn<F>(respond: F) -> FakeServer
where
    F: Fn(&Method, &str, &str) -> (StatusCode, String) + Send + Sync + 'static,
{
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = Arc::new(ServerState {
        requests: requests.clone(),
        respond: Box::new(respond),
    });

    let app = Router::new().fallback(handle).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeServer {
        base_url: format!("http://{}", addr),
        requests,
    }
}

pub fn ok(body: serde_json::Value) -> (StatusCode, String) {
    (StatusCode::OK, body.to_string())
}
