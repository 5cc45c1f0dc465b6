//! Typed message stream over a ComfyUI WebSocket connection.
//!
//! Reads raw frames, parses text frames into [`ComfyUIMessage`]s and
//! yields them. The stream ends when the socket closes or errors.

use futures::stream::{BoxStream, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::client::ComfyUIConnection;
use crate::messages::{parse_message, ComfyUIMessage};

/// Stream of parsed messages from one connection.
pub type MessageStream = BoxStream<'static, ComfyUIMessage>;

/// Turn a live connection into a [`MessageStream`].
///
/// Binary frames (preview images) are skipped. Text frames that fail to
/// parse are logged and skipped, since newer servers send message types
/// this crate does not model.
pub fn message_stream(connection: ComfyUIConnection) -> MessageStream {
    let ComfyUIConnection {
        client_id,
        ws_stream,
    } = connection;

    futures::stream::unfold((ws_stream, client_id), |(mut ws, client_id)| async move {
        while let Some(msg_result) = ws.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match parse_message(&text) {
                    Ok(msg) => return Some((msg, (ws, client_id))),
                    Err(e) => {
                        tracing::debug!(
                            client_id = %client_id,
                            error = %e,
                            "Skipping unrecognised ComfyUI message",
                        );
                    }
                },
                Ok(Message::Binary(_)) => {
                    tracing::trace!(client_id = %client_id, "Ignoring binary message (preview image)");
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    tracing::info!(client_id = %client_id, ?frame, "ComfyUI WebSocket closed");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(client_id = %client_id, error = %e, "WebSocket receive error");
                    return None;
                }
            }
        }
        None
    })
    .boxed()
}
