//! Tunnel task

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::{bind, now, send_all, COMMAND_CHANNEL_CAPACITY, MAX_DATAGRAM};
use crate::channel::SecureChannel;
use crate::error::{LitanyError, LitanyResult};
use crate::tunnel::{Tunnel, TunnelEvent, MANAGE_INTERVAL, RESEND_INTERVAL};
use crate::types::PeerId;

enum Command {
    SendText {
        text: Vec<u8>,
        reply: oneshot::Sender<LitanyResult<u64>>,
    },
}

/// A running tunnel
///
/// # Example
///
/// ```ignore
/// let (events, mut rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
/// let tunnel = Tunnel::new(&settings, peer, None, channel)?;
/// let handle = TunnelHandle::spawn(tunnel, events).await?;
///
/// handle.send_text("hello").await?;
/// while let Ok(event) = rx.recv().await {
///     transcript.apply(&event);
/// }
/// ```
pub struct TunnelHandle {
    peer: PeerId,
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<TunnelEvent>,
    abort: AbortHandle,
    task: Option<JoinHandle<LitanyResult<()>>>,
}

impl TunnelHandle {
    /// Bind a socket and start driving `tunnel`.
    ///
    /// Events are published on `events`; subscribe before spawning to see
    /// the first ones.
    pub async fn spawn<C: SecureChannel>(
        tunnel: Tunnel<C>,
        events: broadcast::Sender<TunnelEvent>,
    ) -> LitanyResult<Self> {
        let (peer, local_addr, socket) = start(&tunnel).await?;
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(tunnel, socket, command_rx, events.clone()));

        Ok(Self {
            peer,
            local_addr,
            commands,
            events,
            abort: task.abort_handle(),
            task: Some(task),
        })
    }

    /// Like [`spawn`](Self::spawn), but the task lives in `set` and its
    /// result comes out of [`JoinSet::join_next`] tagged with the peer.
    ///
    /// [`join`](Self::join) then returns immediately.
    pub async fn spawn_in<C: SecureChannel>(
        tunnel: Tunnel<C>,
        events: broadcast::Sender<TunnelEvent>,
        set: &mut JoinSet<(PeerId, LitanyResult<()>)>,
    ) -> LitanyResult<Self> {
        let (peer, local_addr, socket) = start(&tunnel).await?;
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = run(tunnel, socket, command_rx, events.clone());
        let abort = set.spawn(async move { (peer, task.await) });

        Ok(Self {
            peer,
            local_addr,
            commands,
            events,
            abort,
            task: None,
        })
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The local socket address (bound on all interfaces)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Send text to the peer. Returns the message id.
    pub async fn send_text(&self, text: impl Into<Vec<u8>>) -> LitanyResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendText {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| LitanyError::TunnelClosed)?;

        rx.await.map_err(|_| LitanyError::TunnelClosed)?
    }

    /// Whether the task is still running
    pub fn is_running(&self) -> bool {
        !self.abort.is_finished()
    }

    /// Stop the tunnel. Pending messages are discarded.
    pub fn close(self) {
        debug!(peer = %self.peer, "Closing tunnel");
    }

    /// Wait for the task to end and return how it ended.
    pub async fn join(mut self) -> LitanyResult<()> {
        match self.task.take() {
            Some(task) => task.await.map_err(|_| LitanyError::TunnelClosed)?,
            None => Ok(()),
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

async fn start<C: SecureChannel>(tunnel: &Tunnel<C>) -> LitanyResult<(PeerId, SocketAddr, UdpSocket)> {
    let socket = bind().await?;
    let local_addr = socket.local_addr()?;
    let peer = tunnel.peer();

    info!(%peer, %local_addr, "Starting tunnel");

    Ok((peer, local_addr, socket))
}

async fn run<C: SecureChannel>(
    mut tunnel: Tunnel<C>,
    socket: UdpSocket,
    mut commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<TunnelEvent>,
) -> LitanyResult<()> {
    let peer = tunnel.peer();
    let mut manage = interval(MANAGE_INTERVAL);
    let mut resend = interval(RESEND_INTERVAL);
    manage.set_missed_tick_behavior(MissedTickBehavior::Delay);
    resend.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut buf = vec![0u8; MAX_DATAGRAM];

    flush(&mut tunnel, &socket, &events).await;

    loop {
        let result = tokio::select! {
            _ = manage.tick() => tunnel.manage(now()),
            _ = resend.tick() => tunnel.resend_pending(now()),
            recv = socket.recv_from(&mut buf) => match recv {
                Ok((len, from)) => {
                    trace!(%peer, %from, len, "Datagram received");
                    tunnel.handle_datagram(&buf[..len], now())
                }
                Err(err) => {
                    warn!(%peer, error = %err, "Failed to read datagram");
                    Ok(())
                }
            },
            command = commands.recv() => match command {
                Some(Command::SendText { text, reply }) => {
                    match tunnel.send_text(&text, now()) {
                        Err(err) if err.is_fatal() => {
                            let _ = reply.send(Err(LitanyError::TunnelClosed));
                            Err(err)
                        }
                        other => {
                            let _ = reply.send(other);
                            Ok(())
                        }
                    }
                }
                None => {
                    debug!(%peer, "Tunnel handle dropped");
                    return Ok(());
                }
            },
        };

        flush(&mut tunnel, &socket, &events).await;

        if let Err(err) = result {
            error!(%peer, error = %err, "Tunnel failed");
            return Err(err);
        }
    }
}

async fn flush<C: SecureChannel>(
    tunnel: &mut Tunnel<C>,
    socket: &UdpSocket,
    events: &broadcast::Sender<TunnelEvent>,
) {
    let transmits = std::iter::from_fn(|| tunnel.poll_transmit()).collect();
    send_all(socket, transmits).await;

    while let Some(event) = tunnel.poll_event() {
        // No subscribers is fine
        let _ = events.send(event);
    }
}
