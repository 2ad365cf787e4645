use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use super::*;
use crate::web::router;

fn app(source: Arc<StubSource>) -> Router {
    router(Arc::new(fixed_service(source, false)))
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn loaded_app() -> Router {
    let router = app(StubSource::with_corpus());
    let (status, _) = call(&router, Method::POST, "/preload/verse", None).await;
    assert_eq!(status, StatusCode::OK);
    router
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health() {
    let router = app(StubSource::with_corpus());
    let (status, body) = call(&router, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "healthy" }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_before_and_after_preload() {
    let router = app(StubSource::with_corpus());

    let (_, body) = call(&router, Method::GET, "/status", None).await;
    assert_eq!(body["initialized"], true);
    assert_eq!(body["indices"]["verse"]["loaded"], false);

    let (status, body) = call(&router, Method::POST, "/preload/verse", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["granularity"], "verse");

    let (_, body) = call(&router, Method::GET, "/status", None).await;
    assert_eq!(body["indices"]["verse"]["loaded"], true);
    assert_eq!(body["indices"]["verse"]["count"], 5);
    assert!(body["indices"]["verse"]["memoryBytes"].as_u64().unwrap() > 0);
    assert_eq!(body["indices"]["chapter"]["loaded"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_not_loaded_is_404() {
    let router = app(StubSource::with_corpus());
    let (status, body) = call(&router, Method::GET, "/search?q=love", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not loaded"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_search_response_shape() {
    let router = loaded_app().await;
    let (status, body) = call(&router, Method::GET, "/search?q=love&book=john&k=5", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["query"], "love");
    assert_eq!(body["count"], 2);

    let first = &body["results"][0];
    assert_eq!(first["book"], "John");
    assert_eq!(first["chapter"], 3);
    assert_eq!(first["verseNum"], 16);
    assert_eq!(first["text"], "For God so loved the world");
    assert_eq!(first["_searchMeta"]["reference"], "John 3:16");
    assert_eq!(first["_searchMeta"]["similarity"], first["_searchMeta"]["score"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_search_accepts_query_param_and_ignores_bad_k() {
    let router = loaded_app().await;
    let (status, body) = call(&router, Method::GET, "/search?query=love&k=lots", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_post_search_inline_filter() {
    let router = loaded_app().await;
    let (status, body) = call(
        &router,
        Method::POST,
        "/search",
        Some(json!({ "query": "blessed book:Psalms" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query"], "blessed book:Psalms");
    assert_eq!(body["count"], 1);
    assert_eq!(body["results"][0]["book"], "Psalms");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_post_search_explicit_beats_inline_and_nested_k() {
    let router = loaded_app().await;
    let (_, body) = call(
        &router,
        Method::POST,
        "/search",
        Some(json!({
            "query": "blessed book:Psalms",
            "book": "Matthew",
            "options": { "k": 1, "book": "John" }
        })),
    )
    .await;

    assert_eq!(body["count"], 1);
    assert_eq!(body["results"][0]["book"], "Matthew");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_post_search_bad_requests() {
    let router = loaded_app().await;

    let (status, _) = call(
        &router,
        Method::POST,
        "/search",
        Some(json!({ "query": "love", "granularity": "book" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/search")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_query_is_success_with_no_results() {
    let router = loaded_app().await;
    let (status, body) = call(&router, Method::GET, "/search?q=", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert_eq!(body["results"], json!([]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_preload_while_loading_reports_loading() {
    let source = StubSource::with_corpus();
    let gate = source.hold_next_fetch();
    let service = Arc::new(fixed_service(source, false));
    let router = router(service.clone());

    let loader = {
        let service = service.clone();
        std::thread::spawn(move || service.preload(Granularity::Verse).unwrap())
    };
    gate.wait_entered();

    let (status, body) = call(&router, Method::POST, "/preload/verse", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "loading");

    gate.release();
    loader.join().unwrap();

    let (status, body) = call(&router, Method::POST, "/preload/verse", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "loaded");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_preload_errors() {
    let source = StubSource::with_corpus();
    source.remove(CHAPTER_TEXT);
    let router = app(source);

    let (status, _) = call(&router, Method::POST, "/preload/book", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&router, Method::POST, "/preload/chapter", None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("404"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_embed() {
    let router = app(StubSource::with_corpus());

    let (status, body) = call(
        &router,
        Method::POST,
        "/embed",
        Some(json!({ "text": "grace", "type": "document" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dimensions"], 4);
    assert_eq!(body["embedding"], json!([1.0, 0.0, 0.0, 0.0]));

    let (status, body) = call(&router, Method::POST, "/embed", Some(json!({ "text": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Text is required");
}
