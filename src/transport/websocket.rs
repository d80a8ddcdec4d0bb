// WebSocket transport built on tokio-tungstenite
//
// Each open() spawns one task that owns the socket. Outbound frames reach the
// task over an unbounded channel so send() never blocks the caller.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{ChannelId, EventSink, Transport, TransportError, TransportEvent, TransportEventKind, TransportResult};

enum Outbound {
    Text(String),
    Close,
}

pub struct WsTransport {
    events: EventSink,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl WsTransport {
    pub fn new(events: EventSink) -> Self {
        WsTransport { events, outbound: None }
    }

    async fn run(
        url: String,
        channel: ChannelId,
        events: EventSink,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let emit = |kind: TransportEventKind| {
            // The receiver only goes away when the runtime shuts down
            let _ = events.send(TransportEvent::new(channel, kind));
        };

        let (stream, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("WebSocket connect to {} failed: {}", url, e);
                emit(TransportEventKind::Error(e.to_string()));
                return;
            }
        };
        info!("WebSocket channel {} open to {}", channel, url);
        emit(TransportEventKind::Opened);

        let (mut sink, mut stream) = stream.split();
        loop {
            tokio::select! {
                command = outbound.recv() => match command {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            error!("WebSocket send failed on channel {}: {}", channel, e);
                            emit(TransportEventKind::Error(e.to_string()));
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!("Closing WebSocket channel {}", channel);
                        let _ = sink.close().await;
                        emit(TransportEventKind::Closed);
                        break;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        emit(TransportEventKind::Frame(text.as_str().to_owned()));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("WebSocket channel {} closed by relay", channel);
                        emit(TransportEventKind::Closed);
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong and binary frames are not part of the protocol
                        continue;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error on channel {}: {}", channel, e);
                        emit(TransportEventKind::Error(e.to_string()));
                        break;
                    }
                },
            }
        }
    }
}

impl Transport for WsTransport {
    fn open(&mut self, url: &str, channel: ChannelId) -> TransportResult<()> {
        self.close();
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::ConnectionFailed(format!("no async runtime: {}", e)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(Self::run(url.to_string(), channel, self.events.clone(), rx));
        self.outbound = Some(tx);
        Ok(())
    }

    fn send(&mut self, frame: &str) -> TransportResult<()> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        outbound
            .send(Outbound::Text(frame.to_string()))
            .map_err(|_| TransportError::SendFailed("channel task has exited".to_string()))
    }

    fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Outbound::Close);
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}
