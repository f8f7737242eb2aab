//! `POST /ask` over tiny_http.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Response, Server};
use tracing::{info, warn};

use crate::{Agent, QaError, SharedQa};

const MAX_BODY_BYTES: u64 = 1 << 20;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AskMode {
    #[default]
    Qa,
    Agent,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub mode: AskMode,
}

/// Request handling shared by every connection.
pub struct AskService {
    qa: SharedQa,
    agent: Option<Agent>,
}

impl AskService {
    pub fn new(qa: SharedQa, agent: Option<Agent>) -> Self {
        Self { qa, agent }
    }

    /// Maps one request to a status code and JSON body.
    pub fn handle(&self, method: &Method, path: &str, body: &str) -> (u16, Value) {
        let path = path.split('?').next().unwrap_or(path);
        match (method, path) {
            (Method::Get, "/") => (
                200,
                json!({
                    "status": "ok",
                    "initialized": self.qa.retriever().is_initialized(),
                    "members": self.qa.resolver().registry().len(),
                    "agent": self.agent.is_some(),
                }),
            ),
            (Method::Post, "/ask") => self.ask(body),
            (_, "/ask") => (405, json!({"detail": "Method not allowed"})),
            _ => (404, json!({"detail": "Not found"})),
        }
    }

    fn ask(&self, body: &str) -> (u16, Value) {
        let request: AskRequest = match serde_json::from_str(body) {
            Ok(request) => request,
            Err(err) => {
                return (400, json!({"detail": format!("Invalid request body: {err}")}));
            }
        };
        let question = request.question.trim();
        if question.is_empty() {
            return (400, json!({"detail": "Question field cannot be empty"}));
        }

        match request.mode {
            AskMode::Qa => (200, json!({"answer": self.qa.answer(question)})),
            AskMode::Agent => {
                let Some(agent) = &self.agent else {
                    return (503, json!({"detail": "Agent mode is not configured"}));
                };
                let thread_id = request
                    .thread_id
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| anonymous_thread(question));
                let answer = agent.run(&thread_id, question);
                (200, json!({"answer": answer, "thread_id": thread_id}))
            }
        }
    }
}

fn anonymous_thread(question: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = blake3::Hasher::new();
    hasher.update(question.as_bytes());
    hasher.update(&nanos.to_le_bytes());
    format!("http-{}", &hasher.finalize().to_hex()[..16])
}

fn read_body(request: &mut tiny_http::Request) -> io::Result<String> {
    let mut body = String::new();
    request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)?;
    Ok(body)
}

fn respond_json(request: tiny_http::Request, status: u16, body: &Value) {
    let mut response = Response::from_string(body.to_string()).with_status_code(status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    if let Err(err) = request.respond(response) {
        warn!(error = %err, "failed to write response");
    }
}

fn handle_request(service: &AskService, mut request: tiny_http::Request) {
    let method = request.method().clone();
    let path = request.url().to_string();
    let (status, body) = match read_body(&mut request) {
        Ok(body) => service.handle(&method, &path, &body),
        Err(err) => (400, json!({"detail": format!("Could not read body: {err}")})),
    };
    info!(method = %method, %path, status, "request");
    respond_json(request, status, &body);
}

/// Serves until the listener fails, with `workers` threads pulling requests
/// off the shared listener. Further requests queue in the listener.
pub fn serve(
    service: Arc<AskService>,
    bind: &str,
    port: u16,
    workers: usize,
) -> Result<(), QaError> {
    let addr = format!("{bind}:{port}");
    let server = Arc::new(Server::http(&addr).map_err(|e| QaError::Server(e.to_string()))?);
    info!(%addr, workers, "listening");
    run_workers(server, service, workers)
}

/// Each worker exits on the first listener error, including `Server::unblock`.
fn run_workers(
    server: Arc<Server>,
    service: Arc<AskService>,
    workers: usize,
) -> Result<(), QaError> {
    let workers = workers.max(1);
    let mut handles = Vec::with_capacity(workers);
    for n in 0..workers {
        let server = Arc::clone(&server);
        let service = Arc::clone(&service);
        let handle = thread::Builder::new()
            .name(format!("aurora-http-{n}"))
            .spawn(move || {
                loop {
                    match server.recv() {
                        Ok(request) => handle_request(&service, request),
                        Err(err) => {
                            warn!(error = %err, "http worker stopping");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| QaError::Server(e.to_string()))?;
        handles.push(handle);
    }
    for handle in handles {
        if handle.join().is_err() {
            warn!("http worker panicked");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Duration;

    use super::*;
    use crate::testing::{ScriptedCompletion, StaticIndex};
    use crate::{
        AgentOptions, AnswerSynthesizer, Completion, EntityRegistry, EntityResolver,
        FilteredRetriever, MemoryCheckpointStore, QaSystem, USER_NOT_FOUND,
    };

    fn service(with_agent: bool) -> AskService {
        let qa: SharedQa = Arc::new(QaSystem::new(
            EntityResolver::new(Arc::new(EntityRegistry::builtin()), 70, 5),
            FilteredRetriever::new(Arc::new(StaticIndex::from_rows(&[(
                "Vikram Desai",
                "Vikram: aisle seat",
            )]))),
            AnswerSynthesizer::new(
                Arc::new(ScriptedCompletion::new(Vec::new())),
                0.2,
                64,
                Duration::from_secs(1),
            ),
            10,
        ));
        let agent = with_agent.then(|| {
            Agent::new(
                Arc::clone(&qa),
                Arc::new(ScriptedCompletion::repeating(Completion::text("agent says hi"))),
                Arc::new(MemoryCheckpointStore::new()),
                AgentOptions::default(),
            )
        });
        AskService::new(qa, agent)
    }

    #[test]
    fn empty_question_is_a_client_error() {
        let svc = service(false);
        for body in [r#"{"question": ""}"#, r#"{"question": "   "}"#, "{}"] {
            let (status, reply) = svc.handle(&Method::Post, "/ask", body);
            assert_eq!(status, 400);
            assert_eq!(reply["detail"], "Question field cannot be empty");
        }
    }

    #[test]
    fn malformed_json_is_a_client_error() {
        let (status, reply) = service(false).handle(&Method::Post, "/ask", "{question");
        assert_eq!(status, 400);
        assert!(reply["detail"].as_str().unwrap_or("").starts_with("Invalid request body"));
    }

    #[test]
    fn qa_mode_returns_the_pipeline_answer() {
        let (status, reply) = service(false).handle(
            &Method::Post,
            "/ask",
            r#"{"question": "What is the weather?"}"#,
        );
        assert_eq!(status, 200);
        assert_eq!(reply["answer"], USER_NOT_FOUND);
    }

    #[test]
    fn agent_mode_uses_the_given_thread() {
        let (status, reply) = service(true).handle(
            &Method::Post,
            "/ask",
            r#"{"question": "hello", "mode": "agent", "thread_id": "abc"}"#,
        );
        assert_eq!(status, 200);
        assert_eq!(reply["answer"], "agent says hi");
        assert_eq!(reply["thread_id"], "abc");

        let (status, _) =
            service(false).handle(&Method::Post, "/ask", r#"{"question": "hi", "mode": "agent"}"#);
        assert_eq!(status, 503);
    }

    #[test]
    fn status_and_unknown_routes() {
        let svc = service(false);
        let (status, reply) = svc.handle(&Method::Get, "/", "");
        assert_eq!(status, 200);
        assert_eq!(reply["initialized"], true);
        assert_eq!(reply["members"], 10);
        assert_eq!(svc.handle(&Method::Get, "/nope", "").0, 404);
        assert_eq!(svc.handle(&Method::Get, "/ask", "").0, 405);
    }

    #[test]
    fn fixed_workers_serve_more_requests_than_threads() {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("bind"));
        let addr = server.server_addr().to_ip().expect("tcp listener");
        let running = {
            let server = Arc::clone(&server);
            let svc = Arc::new(service(false));
            thread::spawn(move || run_workers(server, svc, 2))
        };

        for _ in 0..5 {
            let mut stream = TcpStream::connect(addr).expect("connect");
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .expect("write");
            let mut reply = String::new();
            stream.read_to_string(&mut reply).expect("read");
            assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
            assert!(reply.contains("\"initialized\":true"), "{reply}");
        }

        server.unblock();
        server.unblock();
        assert!(running.join().expect("join").is_ok());
    }
}
