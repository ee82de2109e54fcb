//! Beacon task

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::{bind, send_all, COMMAND_CHANNEL_CAPACITY, MAX_DATAGRAM};
use crate::beacon::{Beacon, BeaconUpdate, Liturgy, SignalBeacon, LITURGY_INTERVAL};
use crate::channel::SecureChannel;
use crate::error::{LitanyError, LitanyResult};
use crate::types::PeerId;

type Command<B> = Box<dyn FnOnce(&mut B) + Send>;

/// A running beacon
///
/// Beacons only report changes, so updates go over an unbounded channel
/// and are never dropped.
pub struct BeaconHandle<B> {
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command<B>>,
    task: Option<JoinHandle<LitanyResult<()>>>,
}

impl<B: Beacon> BeaconHandle<B> {
    /// Bind a socket and start driving `liturgy`. The first beacon goes out
    /// right away, then every [`LITURGY_INTERVAL`]. Updates go to `updates`
    /// in the order the beacon produced them.
    pub async fn spawn<C: SecureChannel>(
        liturgy: Liturgy<B, C>,
        updates: mpsc::UnboundedSender<BeaconUpdate>,
    ) -> LitanyResult<Self> {
        let socket = bind().await?;
        let local_addr = socket.local_addr()?;

        info!(
            discovery = liturgy.beacon().is_discovery(),
            %local_addr,
            "Starting liturgy"
        );

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(liturgy, socket, command_rx, updates));

        Ok(Self {
            local_addr,
            commands,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run `f` against the beacon inside its task.
    pub async fn update(&self, f: impl FnOnce(&mut B) + Send + 'static) -> LitanyResult<()> {
        self.commands
            .send(Box::new(f))
            .await
            .map_err(|_| LitanyError::BeaconClosed)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Wait for the task to end and return how it ended.
    pub async fn join(mut self) -> LitanyResult<()> {
        match self.task.take() {
            Some(task) => task.await.map_err(|_| LitanyError::BeaconClosed)?,
            None => Ok(()),
        }
    }
}

impl BeaconHandle<SignalBeacon> {
    /// Mark whether we want to chat with `peer`.
    pub async fn set_intent(&self, peer: PeerId, on: bool) -> LitanyResult<()> {
        self.update(move |beacon| beacon.set_intent(peer, on)).await
    }
}

impl<B> Drop for BeaconHandle<B> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run<B: Beacon, C: SecureChannel>(
    mut liturgy: Liturgy<B, C>,
    socket: UdpSocket,
    mut commands: mpsc::Receiver<Command<B>>,
    updates: mpsc::UnboundedSender<BeaconUpdate>,
) -> LitanyResult<()> {
    let mut ticker = interval(LITURGY_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let result = tokio::select! {
            _ = ticker.tick() => liturgy.send(),
            recv = socket.recv_from(&mut buf) => match recv {
                Ok((len, from)) => {
                    trace!(%from, len, "Datagram received");
                    liturgy.handle_datagram(&buf[..len])
                }
                Err(err) => {
                    warn!(error = %err, "Failed to read datagram");
                    Ok(())
                }
            },
            command = commands.recv() => match command {
                Some(f) => {
                    f(liturgy.beacon_mut());
                    Ok(())
                }
                None => {
                    debug!("Beacon handle dropped");
                    return Ok(());
                }
            },
        };

        let transmits = std::iter::from_fn(|| liturgy.poll_transmit()).collect();
        send_all(&socket, transmits).await;

        let delivered = std::iter::from_fn(|| liturgy.poll_update())
            .all(|update| updates.send(update).is_ok());

        if let Err(err) = result {
            error!(error = %err, "Liturgy failed");
            return Err(err);
        }

        if !delivered {
            debug!("Beacon consumer gone");
            return Ok(());
        }
    }
}
