//! Native WebSocket implementation using tokio-tungstenite.

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use deskline_shared::ABNORMAL_CLOSE_CODE;

use super::{Connector, Incoming, Outbound, TransportSocket, WsHandle};

/// Close frame without a status code (RFC 6455 §7.4.1).
const NO_STATUS_CODE: u16 = 1005;

/// Dials real sockets; each connection gets its own reader and writer task.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<TransportSocket, String> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| format!("Failed to connect to {url}: {e}"))?;
        crate::log_info!("WebSocket connected to {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = unbounded::<Outbound>();
        let (in_tx, in_rx) = unbounded::<Incoming>();

        // Spawn read task
        tokio::spawn(async move {
            let code = read_loop(&mut read, &in_tx).await;
            let _ = in_tx.unbounded_send(Incoming::Closed { code });
        });

        // Spawn write task
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.next().await {
                match outbound {
                    Outbound::Text(json) => {
                        if let Err(e) = write.send(Message::text(json)).await {
                            crate::log_error!("Send failed: {}", e);
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            crate::log_debug!("Close frame not delivered: {}", e);
                        }
                        break;
                    }
                }
            }
            crate::log_debug!("Stopping write task");
        });

        Ok(TransportSocket::new(WsHandle::new(out_tx), in_rx))
    }
}

/// Forward inbound text until the socket ends; returns the close code.
async fn read_loop<S>(read: &mut S, in_tx: &UnboundedSender<Incoming>) -> u16
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                crate::log_debug!("WebSocket received: {}", text.as_str());
                if in_tx
                    .unbounded_send(Incoming::Text(text.as_str().to_owned()))
                    .is_err()
                {
                    // Socket owner dropped us; nothing left to deliver to.
                    return ABNORMAL_CLOSE_CODE;
                }
            }
            Ok(Message::Close(frame)) => {
                let code = frame.map(|f| u16::from(f.code)).unwrap_or(NO_STATUS_CODE);
                crate::log_info!("WebSocket received close frame ({})", code);
                return code;
            }
            Ok(Message::Ping(data)) => {
                // Pong is handled automatically by tungstenite
                crate::log_debug!("Received ping: {:?}", data);
            }
            Ok(_) => {
                // Ignore binary, pong, etc.
            }
            Err(e) => {
                crate::log_error!("WebSocket read error: {}", e);
                let _ = in_tx.unbounded_send(Incoming::Error(e.to_string()));
                return ABNORMAL_CLOSE_CODE;
            }
        }
    }
    ABNORMAL_CLOSE_CODE
}
