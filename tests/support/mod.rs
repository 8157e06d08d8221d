//! Scripted transport for driving the fetch orchestrator in tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use cachefetch::agent::Agent;
use cachefetch::{FetchError, Options, Request, Response, ResponseBody, Transport};

pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

pub enum Scripted {
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    Error(FetchError),
    /// Stall for this long before answering 200; used to trip the
    /// per-attempt deadline.
    Hang { ms: u64 },
}

/// A transport that replays a scripted sequence of outcomes and records
/// every request it sees.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_response(&self, status: u16, headers: &[(&str, &str)], body: &[u8]) {
        self.script.lock().unwrap().push_back(Scripted::Response {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
        });
    }

    pub fn push_error(&self, err: FetchError) {
        self.script.lock().unwrap().push_back(Scripted::Error(err));
    }

    pub fn push_hang(&self, ms: u64) {
        self.script.lock().unwrap().push_back(Scripted::Hang { ms });
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request_headers(&self, idx: usize) -> HeaderMap {
        self.requests.lock().unwrap()[idx].headers.clone()
    }

    pub fn request_method(&self, idx: usize) -> Method {
        self.requests.lock().unwrap()[idx].method.clone()
    }

    pub fn request_url(&self, idx: usize) -> String {
        self.requests.lock().unwrap()[idx].url.clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn roundtrip(
        &self,
        req: Request,
        _agent: Arc<Agent>,
        _opts: &Options,
    ) -> Result<Response, FetchError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            method: req.method.clone(),
            url: req.url.to_string(),
            headers: req.headers.clone(),
        });

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Response {
                status,
                headers,
                body,
            }) => {
                let mut map = HeaderMap::new();
                for (name, value) in &headers {
                    map.append(
                        HeaderName::try_from(name.as_str()).unwrap(),
                        HeaderValue::from_str(value).unwrap(),
                    );
                }
                let status = StatusCode::from_u16(status).unwrap();
                let body = if body.is_empty() {
                    ResponseBody::Empty
                } else {
                    ResponseBody::full(Bytes::from(body))
                };
                Ok(Response::new(status, map, req.url.clone(), body))
            }
            Some(Scripted::Error(err)) => Err(err),
            Some(Scripted::Hang { ms }) => {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                Ok(Response::new(
                    StatusCode::OK,
                    HeaderMap::new(),
                    req.url.clone(),
                    ResponseBody::full(Bytes::from_static(b"late")),
                ))
            }
            None => Err(FetchError::Protocol(format!(
                "unexpected request to {}",
                req.url
            ))),
        }
    }
}
