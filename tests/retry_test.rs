//! Retry engine behavior through the public fetch API.

mod support;

use std::time::Duration;

use http::{Method, StatusCode};

use cachefetch::{FetchError, Fetcher, Options, RetryConfig, TransportCode};
use support::ScriptedTransport;

fn fast_retry(retries: u32) -> RetryConfig {
    RetryConfig {
        retries,
        factor: 2.0,
        min_timeout: Duration::from_millis(1),
        max_timeout: Duration::from_millis(5),
        randomize: false,
    }
}

fn reset_error() -> FetchError {
    FetchError::Transport {
        code: TransportCode::ConnectionReset,
        url: "https://example.com/".into(),
        message: "connection reset by peer".into(),
    }
}

#[tokio::test]
async fn test_get_retries_past_timeouts() {
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        transport.push_hang(5_000);
    }
    transport.push_response(200, &[], b"finally");
    let fetcher = Fetcher::with_transport(transport.clone());

    let mut opts = Options::default();
    opts.retry = Some(fast_retry(4));
    opts.timeout = Some(Duration::from_millis(10));

    let res = fetcher
        .fetch("https://example.com/slow", opts)
        .await
        .unwrap();
    assert_eq!(res.headers().get("x-fetch-attempts").unwrap(), "4");
    assert_eq!(res.text().await.unwrap(), "finally");
}

#[tokio::test]
async fn test_post_is_never_retried() {
    let transport = ScriptedTransport::new();
    transport.push_hang(5_000);
    let fetcher = Fetcher::with_transport(transport.clone());

    let mut opts = Options::default();
    opts.method = Some(Method::POST);
    opts.body = Some("payload".into());
    opts.retry = Some(fast_retry(4));
    opts.timeout = Some(Duration::from_millis(10));

    let err = fetcher
        .fetch("https://example.com/slow", opts)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "request-timeout");
    assert_eq!(transport.request_count(), 1);
    assert_eq!(transport.request_method(0), Method::POST);
    assert_eq!(transport.remaining(), 0);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let transport = ScriptedTransport::new();
    transport.push_error(reset_error());
    transport.push_error(reset_error());
    transport.push_response(200, &[], b"recovered");
    let fetcher = Fetcher::with_transport(transport.clone());

    let mut opts = Options::default();
    opts.retry = Some(fast_retry(3));

    let res = fetcher
        .fetch("https://example.com/flaky", opts)
        .await
        .unwrap();
    assert_eq!(res.headers().get("x-fetch-attempts").unwrap(), "3");
    assert_eq!(res.text().await.unwrap(), "recovered");
}

#[tokio::test]
async fn test_retriable_status_eventually_returned_as_response() {
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        transport.push_response(503, &[], b"unavailable");
    }
    let fetcher = Fetcher::with_transport(transport.clone());

    let mut opts = Options::default();
    opts.retry = Some(fast_retry(2));

    // Retries exhausted: the final status comes back as a response, not
    // an error.
    let res = fetcher
        .fetch("https://example.com/down", opts)
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.headers().get("x-fetch-attempts").unwrap(), "3");
    assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn test_rate_limit_statuses_are_retried() {
    let transport = ScriptedTransport::new();
    transport.push_response(429, &[], b"slow down");
    transport.push_response(200, &[], b"ok now");
    let fetcher = Fetcher::with_transport(transport.clone());

    let mut opts = Options::default();
    opts.retry = Some(fast_retry(2));

    let res = fetcher
        .fetch("https://example.com/limited", opts)
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers().get("x-fetch-attempts").unwrap(), "2");
}

#[tokio::test]
async fn test_plain_4xx_is_not_retried() {
    let transport = ScriptedTransport::new();
    transport.push_response(404, &[], b"nope");
    let fetcher = Fetcher::with_transport(transport.clone());

    let mut opts = Options::default();
    opts.retry = Some(fast_retry(5));

    let res = fetcher
        .fetch("https://example.com/absent", opts)
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(res.headers().get("x-fetch-attempts").unwrap(), "1");
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_dns_failure_is_not_retried() {
    let transport = ScriptedTransport::new();
    transport.push_error(FetchError::Transport {
        code: TransportCode::NotFound,
        url: "https://no.such.host/".into(),
        message: "failed to resolve no.such.host".into(),
    });
    let fetcher = Fetcher::with_transport(transport.clone());

    let mut opts = Options::default();
    opts.retry = Some(fast_retry(5));

    let err = fetcher
        .fetch("https://no.such.host/", opts)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ENOTFOUND");
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_stream_body_disables_retry() {
    use bytes::Bytes;
    use cachefetch::Body;

    let transport = ScriptedTransport::new();
    transport.push_error(reset_error());
    let fetcher = Fetcher::with_transport(transport.clone());

    let chunks =
        futures::stream::iter(vec![Ok::<_, FetchError>(Bytes::from_static(b"streamed"))]);
    let mut opts = Options::default();
    opts.method = Some(Method::PUT);
    opts.body = Some(Body::Stream(Box::pin(chunks)));
    opts.retry = Some(fast_retry(5));

    let err = fetcher
        .fetch("https://example.com/upload", opts)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ECONNRESET");
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_retries_disabled() {
    let transport = ScriptedTransport::new();
    transport.push_error(reset_error());
    let fetcher = Fetcher::with_transport(transport.clone());

    let mut opts = Options::default();
    opts.retry = Some(RetryConfig::disabled());

    let err = fetcher
        .fetch("https://example.com/once", opts)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ECONNRESET");
    assert_eq!(transport.request_count(), 1);
}
