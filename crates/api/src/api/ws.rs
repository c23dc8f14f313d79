//! WebSocket endpoints for live progress.
//!
//! Each connection registers a sink with the progress hub and forwards the
//! hub's payloads to the peer. Inbound frames are kept to protocol
//! housekeeping: pings get pongs, client text is ignored, close ends the
//! subscription.

use actix_web::{HttpRequest, HttpResponse, get, web, web::Data};
use actix_ws::Message;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::hub::{ProgressHub, SubscriberId};

/// Per-task progress stream
#[get("/ws/tasks/{task_id}")]
pub(crate) async fn task_updates(
    req: HttpRequest,
    body: web::Payload,
    task_id: web::Path<String>,
    hub: Data<ProgressHub>,
) -> actix_web::Result<HttpResponse> {
    let Ok(task_id) = Uuid::parse_str(&task_id) else {
        return Ok(HttpResponse::BadRequest()
            .json(serde_json::json!({ "error": "invalid task id" })));
    };

    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;

    let hub = hub.into_inner();
    let (subscriber, receiver) = hub.subscribe(Some(task_id));
    debug!(task_id = %task_id, "websocket subscriber connected");
    actix_web::rt::spawn(serve_subscription(
        session, msg_stream, hub, subscriber, receiver,
    ));

    Ok(response)
}

/// All-tasks progress stream backing the history view
#[get("/ws/history")]
pub(crate) async fn history_updates(
    req: HttpRequest,
    body: web::Payload,
    hub: Data<ProgressHub>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;

    let hub = hub.into_inner();
    let (subscriber, receiver) = hub.subscribe(None);
    debug!("history websocket subscriber connected");
    actix_web::rt::spawn(serve_subscription(
        session, msg_stream, hub, subscriber, receiver,
    ));

    Ok(response)
}

async fn serve_subscription(
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
    hub: Arc<ProgressHub>,
    subscriber: SubscriberId,
    mut receiver: tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    loop {
        tokio::select! {
            maybe_event = receiver.recv() => match maybe_event {
                Some(payload) => {
                    if session.text(payload).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            maybe_frame = msg_stream.next() => match maybe_frame {
                Some(Ok(Message::Ping(bytes))) => {
                    if session.pong(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Client text frames (keepalives) carry no meaning here
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unsubscribe(&subscriber);
    let _ = session.close(None).await;
    debug!("websocket subscriber disconnected");
}
