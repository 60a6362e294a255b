#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::{Response, StatusCode, Uri};
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

type Handler = dyn Fn(&Uri, &str) -> (StatusCode, String) + Send + Sync;

#[derive(Clone)]
struct Shared {
    seen: Arc<Mutex<Vec<(String, String)>>>,
    handler: Arc<Handler>,
}

/// Base URL of the server and the `(path?query, body)` of every request.
pub struct Controller {
    pub base_url: String,
    pub seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl Controller {
    pub fn requests(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

async fn dispatch(State(shared): State<Shared>, uri: Uri, body: String) -> Response<Body> {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    shared.seen.lock().unwrap().push((target, body.clone()));

    let (status, text) = (shared.handler)(&uri, &body);
    Response::builder()
        .status(status)
        .body(Body::from(text))
        .unwrap()
}

pub async fn serve<F>(handler: F) -> Controller
where
    F: Fn(&Uri, &str) -> (StatusCode, String) + Send + Sync + 'static,
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let shared = Shared {
        seen: seen.clone(),
        handler: Arc::new(handler),
    };

    let app = Router::new().fallback(dispatch).with_state(shared);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Controller { base_url, seen }
}

/// Decode the `reqxml` field of a form body.
pub fn reqxml(body: &str) -> String {
    url::form_urlencoded::parse(body.as_bytes())
        .find(|(key, _)| key == "reqxml")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

/// Query parameters of a request target.
pub fn query(target: &str) -> Vec<(String, String)> {
    let query = target.split_once('?').map(|(_, q)| q).unwrap_or_default();
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}
