use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{
    Agent, BrowserSession, PolicyEngine, Reasoner, RunControl, RunEvent, RunState, SessionFactory,
};

pub struct AppState<R: Reasoner, P: PolicyEngine> {
    pub agent: Arc<Agent<R, P>>,
    pub sessions: Arc<dyn SessionFactory>,
    /// One permit per concurrently running goal.
    pub permits: Arc<Semaphore>,
}

impl<R: Reasoner, P: PolicyEngine> Clone for AppState<R, P> {
    fn clone(&self) -> Self {
        Self {
            agent: self.agent.clone(),
            sessions: self.sessions.clone(),
            permits: self.permits.clone(),
        }
    }
}

impl<R: Reasoner, P: PolicyEngine> AppState<R, P> {
    pub fn new(agent: Agent<R, P>, sessions: Arc<dyn SessionFactory>, max_concurrent_runs: usize) -> Self {
        Self {
            agent: Arc::new(agent),
            sessions,
            permits: Arc::new(Semaphore::new(max_concurrent_runs)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
    /// Successfully executed actions, one JSON line each.
    pub code: String,
    pub run: RunState,
}

impl From<RunState> for ChatResponse {
    fn from(run: RunState) -> Self {
        Self {
            reply: run.status_text(),
            code: run.executed_actions().join("\n"),
            run,
        }
    }
}

pub fn router<R, P>(state: AppState<R, P>) -> Router
where
    R: Reasoner + 'static,
    P: PolicyEngine + 'static,
{
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/chat", post(chat_handler::<R, P>))
        .route("/chat/stream", post(chat_stream_handler::<R, P>))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state)
}

pub async fn serve<R, P>(state: AppState<R, P>, bind: &str) -> anyhow::Result<()>
where
    R: Reasoner + 'static,
    P: PolicyEngine + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "web endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

fn reply(status: StatusCode, text: impl Into<String>) -> Response {
    (status, Json(json!({ "reply": text.into() }))).into_response()
}

/// Validates the goal and takes a run slot; the permit is held until the run ends.
fn admit<R: Reasoner, P: PolicyEngine>(
    state: &AppState<R, P>,
    req: &ChatRequest,
) -> Result<(String, OwnedSemaphorePermit), Response> {
    let goal = req.message.trim();
    if goal.is_empty() {
        return Err(reply(StatusCode::BAD_REQUEST, "Please describe what to do on Amazon."));
    }
    let permit = state.permits.clone().try_acquire_owned().map_err(|_| {
        warn!("rejecting goal: all run slots busy");
        reply(StatusCode::SERVICE_UNAVAILABLE, "Too many runs in progress, try again shortly.")
    })?;
    Ok((goal.to_string(), permit))
}

async fn chat_handler<R, P>(State(state): State<AppState<R, P>>, Json(req): Json<ChatRequest>) -> Response
where
    R: Reasoner + 'static,
    P: PolicyEngine + 'static,
{
    let (goal, permit) = match admit(&state, &req) {
        Ok(admitted) => admitted,
        Err(resp) => return resp,
    };
    info!(goal = %goal, "POST /chat");
    let session = match state.sessions.open_session().await {
        Ok(session) => session,
        Err(err) => {
            warn!("browser launch failed: {}", err);
            return reply(StatusCode::INTERNAL_SERVER_ERROR, format!("An error occurred: {err}"));
        }
    };

    // Dropping the handler future (client went away) cancels the run.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let run = spawn_run(state.agent.clone(), goal, session, RunControl::new(cancel), permit).await;
    guard.disarm();

    match run {
        Ok(run) => Json(ChatResponse::from(run)).into_response(),
        Err(err) => reply(StatusCode::INTERNAL_SERVER_ERROR, format!("An error occurred: {err}")),
    }
}

async fn chat_stream_handler<R, P>(
    State(state): State<AppState<R, P>>,
    Json(req): Json<ChatRequest>,
) -> Response
where
    R: Reasoner + 'static,
    P: PolicyEngine + 'static,
{
    let (goal, permit) = match admit(&state, &req) {
        Ok(admitted) => admitted,
        Err(resp) => return resp,
    };
    info!(goal = %goal, "POST /chat/stream");
    let (tx, rx) = mpsc::unbounded_channel();
    match state.sessions.open_session().await {
        Ok(session) => {
            let cancel = CancellationToken::new();
            let guard = cancel.clone().drop_guard();
            let control = RunControl::new(cancel).with_events(tx);
            drop(spawn_run(state.agent.clone(), goal, session, control, permit));
            // The guard lives as long as the response body; a disconnect drops both.
            let stream = UnboundedReceiverStream::new(rx).map(move |event| {
                let _ = &guard;
                Ok::<_, Infallible>(to_sse_event(&event))
            });
            Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
        }
        Err(err) => {
            warn!("browser launch failed: {}", err);
            let _ = tx.send(RunEvent::Aborted { message: format!("An error occurred: {err}") });
            drop(tx);
            let stream = UnboundedReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
            Sse::new(stream).into_response()
        }
    }
}

/// Runs the goal on its own task so session cleanup finishes even if the caller goes away.
fn spawn_run<R, P>(
    agent: Arc<Agent<R, P>>,
    goal: String,
    session: Box<dyn BrowserSession>,
    control: RunControl,
    permit: OwnedSemaphorePermit,
) -> tokio::task::JoinHandle<RunState>
where
    R: Reasoner + 'static,
    P: PolicyEngine + 'static,
{
    tokio::spawn(async move {
        let _permit = permit;
        agent.run_with(&goal, session, control).await
    })
}

fn to_sse_event(event: &RunEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string());
    Event::default().event(event.name()).data(data)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>cart-pilot</title>
<style>
  * { box-sizing: border-box; }
  body { font-family: system-ui, sans-serif; max-width: 760px; margin: 40px auto; padding: 0 16px; color: #1d1d1f; }
  h1 { font-size: 1.4rem; }
  form { display: flex; gap: 8px; }
  input { flex: 1; padding: 10px; font-size: 1rem; border: 1px solid #ccc; border-radius: 6px; }
  button { padding: 10px 16px; font-size: 1rem; border: 0; border-radius: 6px; background: #ff9900; cursor: pointer; }
  button:disabled { opacity: .5; cursor: default; }
  #reply { margin-top: 20px; font-weight: 600; }
  pre { background: #f4f4f5; padding: 12px; border-radius: 6px; white-space: pre-wrap; word-break: break-all; }
</style>
</head>
<body>
<h1>cart-pilot</h1>
<form id="goal-form">
  <input id="goal" placeholder="e.g. search RTX 4090 and sort by price high to low" autocomplete="off">
  <button id="go" type="submit">Run</button>
</form>
<div id="reply"></div>
<pre id="code" hidden></pre>
<script>
const form = document.getElementById('goal-form');
const go = document.getElementById('go');
const replyEl = document.getElementById('reply');
const codeEl = document.getElementById('code');
form.addEventListener('submit', async (e) => {
  e.preventDefault();
  const message = document.getElementById('goal').value.trim();
  if (!message) return;
  go.disabled = true;
  replyEl.textContent = 'Working...';
  codeEl.hidden = true;
  try {
    const res = await fetch('/chat', {
      method: 'POST',
      headers: { 'Content-Type': 'application/json' },
      body: JSON.stringify({ message }),
    });
    const body = await res.json();
    replyEl.textContent = body.reply;
    if (body.code) {
      codeEl.textContent = body.code;
      codeEl.hidden = false;
    }
  } catch (err) {
    replyEl.textContent = 'An error occurred: ' + err;
  } finally {
    go.disabled = false;
  }
});
</script>
</body>
</html>
"##;
