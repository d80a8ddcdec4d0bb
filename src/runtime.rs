// Runtime driver for the messenger
//
// One tokio task owns the `Messenger`. User requests, transport events and
// timer expiries are all funnelled into that task, so every state transition
// runs to completion before the next input is looked at.

use anyhow::{anyhow, Result};
use log::{debug, info};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection::{TimerKind, TimerToken};
use crate::events::{EventBus, MessengerEvent};
use crate::messenger::{Messenger, SendOutcome, TimerRequest};
use crate::models::{Attachment, Message, StatusSnapshot};
use crate::transport::TransportEvent;

enum Request {
    Send {
        text: String,
        sender: String,
        avatar: String,
        attachment: Option<Attachment>,
        reply: oneshot::Sender<SendOutcome>,
    },
    EnableOffline,
    DisableOffline,
    Flush,
    Clear,
    Status(oneshot::Sender<StatusSnapshot>),
    Messages(oneshot::Sender<Vec<Message>>),
    Pending(oneshot::Sender<Vec<Message>>),
    Shutdown,
}

/// Cloneable handle to a running messenger task
#[derive(Clone)]
pub struct MessengerHandle {
    requests: mpsc::Sender<Request>,
    events: EventBus,
}

impl MessengerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.events.subscribe()
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| anyhow!("Messenger task has stopped"))
    }

    pub async fn send(&self, text: &str, sender: &str, avatar: &str) -> Result<SendOutcome> {
        self.send_with_attachment(text, sender, avatar, None).await
    }

    pub async fn send_with_attachment(
        &self,
        text: &str,
        sender: &str,
        avatar: &str,
        attachment: Option<Attachment>,
    ) -> Result<SendOutcome> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Send {
            text: text.to_string(),
            sender: sender.to_string(),
            avatar: avatar.to_string(),
            attachment,
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("Messenger task dropped the send request"))
    }

    pub async fn enable_offline(&self) -> Result<()> {
        self.request(Request::EnableOffline).await
    }

    pub async fn disable_offline(&self) -> Result<()> {
        self.request(Request::DisableOffline).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.request(Request::Flush).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.request(Request::Clear).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Status(reply)).await?;
        rx.await.map_err(|_| anyhow!("Messenger task dropped the status request"))
    }

    pub async fn messages(&self) -> Result<Vec<Message>> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Messages(reply)).await?;
        rx.await.map_err(|_| anyhow!("Messenger task dropped the messages request"))
    }

    pub async fn pending(&self) -> Result<Vec<Message>> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Pending(reply)).await?;
        rx.await.map_err(|_| anyhow!("Messenger task dropped the pending request"))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(Request::Shutdown).await
    }
}

/// Start the driver task. `transport_events` must be the receiving half of
/// the sink the transport was built with.
pub fn spawn(
    messenger: Messenger,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) -> (MessengerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(100);
    let handle = MessengerHandle {
        requests: tx,
        events: messenger.events().clone(),
    };
    let task = tokio::spawn(run(messenger, rx, transport_events));
    (handle, task)
}

struct Timers {
    fired: mpsc::UnboundedSender<TimerToken>,
    running: HashMap<TimerKind, JoinHandle<()>>,
}

impl Timers {
    fn apply(&mut self, requests: Vec<TimerRequest>) {
        for request in requests {
            match request {
                TimerRequest::Start { token, delay } => {
                    let fired = self.fired.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = fired.send(token);
                    });
                    if let Some(previous) = self.running.insert(token.kind(), task) {
                        previous.abort();
                    }
                }
                TimerRequest::Cancel(kind) => {
                    if let Some(task) = self.running.remove(&kind) {
                        task.abort();
                    }
                }
            }
        }
    }

    fn abort_all(&mut self) {
        for (_, task) in self.running.drain() {
            task.abort();
        }
    }
}

async fn run(
    mut messenger: Messenger,
    mut requests: mpsc::Receiver<Request>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
    let mut timers = Timers {
        fired: fired_tx,
        running: HashMap::new(),
    };

    info!("Messenger task started");
    messenger.start();
    timers.apply(messenger.take_timer_requests());

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    debug!("All messenger handles dropped");
                    break;
                };
                match request {
                    Request::Send { text, sender, avatar, attachment, reply } => {
                        let outcome = messenger.send_with_attachment(&text, &sender, &avatar, attachment);
                        let _ = reply.send(outcome);
                    }
                    Request::EnableOffline => messenger.enable_offline(),
                    Request::DisableOffline => messenger.disable_offline(),
                    Request::Flush => messenger.flush(),
                    Request::Clear => messenger.clear(),
                    Request::Status(reply) => {
                        let _ = reply.send(messenger.status());
                    }
                    Request::Messages(reply) => {
                        let _ = reply.send(messenger.messages().to_vec());
                    }
                    Request::Pending(reply) => {
                        let _ = reply.send(messenger.pending());
                    }
                    Request::Shutdown => break,
                }
            }
            Some(event) = transport_events.recv() => {
                messenger.handle_transport_event(event);
            }
            Some(token) = fired_rx.recv() => {
                messenger.handle_timer(token);
            }
        }
        timers.apply(messenger.take_timer_requests());
    }

    messenger.shutdown();
    timers.apply(messenger.take_timer_requests());
    timers.abort_all();
    info!("Messenger task stopped");
}
