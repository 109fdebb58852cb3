use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, ToSocketAddrs,
    },
    sync::{mpsc, oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{Daemon, EventStream, GroupConnection, GroupEvent, Guarantee, MemberId};
use crate::common::{Error, Result};

/*
    Remote members reach a daemon over TCP. Each direction carries one JSON
    frame per line. Every client request is answered by exactly one reply, in
    request order; events are interleaved freely with replies.
*/

#[derive(Debug, Serialize, Deserialize)]
enum ClientFrame {
    Connect { name: String },
    Join { group: String },
    Leave { group: String },
    Multicast {
        group: String,
        guarantee: Guarantee,
        payload: Vec<u8>,
    },
    Disconnect,
}

#[derive(Debug, Serialize, Deserialize)]
enum ServerFrame {
    Ok,
    Error { reason: String },
    Event(GroupEvent),
}

impl From<Result<()>> for ServerFrame {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => ServerFrame::Ok,
            Err(e) => ServerFrame::Error {
                reason: e.to_string(),
            },
        }
    }
}

/// Accept remote members for `daemon` until the listener fails.
pub async fn serve(listener: TcpListener, daemon: Daemon) -> Result<()> {
    info!(addr = ?listener.local_addr()?, "daemon listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let daemon = daemon.clone();
        tokio::spawn(async move {
            debug!(%peer, "session opened");
            if let Err(e) = session(stream, daemon).await {
                warn!(%peer, error = %e, "session failed");
            }
            debug!(%peer, "session closed");
        });
    }
}

async fn session(stream: TcpStream, daemon: Daemon) -> Result<()> {
    let (read, write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let (frames, frames_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(write, frames_rx));

    // The first frame names the member
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };
    let name = match serde_json::from_str::<ClientFrame>(&line)? {
        ClientFrame::Connect { name } => name,
        other => {
            let _ = frames.send(ServerFrame::Error {
                reason: format!("expected connect, got {other:?}"),
            });
            drop(frames);
            let _ = writer.await;
            return Ok(());
        }
    };
    let (connection, mut events) = match daemon.connect(name).await {
        Ok(connected) => connected,
        Err(e) => {
            let _ = frames.send(ServerFrame::from(Err::<(), _>(e)));
            drop(frames);
            let _ = writer.await;
            return Ok(());
        }
    };
    let _ = frames.send(ServerFrame::Ok);

    let forward = {
        let frames = frames.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if frames.send(ServerFrame::Event(event)).is_err() {
                    break;
                }
            }
        })
    };

    while let Some(line) = lines.next_line().await? {
        let frame: ClientFrame = serde_json::from_str(&line)?;
        let result = match frame {
            ClientFrame::Join { group } => connection.join(&group).await,
            ClientFrame::Leave { group } => connection.leave(&group).await,
            ClientFrame::Multicast {
                group,
                guarantee,
                payload,
            } => connection.multicast(&group, guarantee, payload).await,
            ClientFrame::Disconnect => {
                let result = connection.disconnect().await;
                let _ = frames.send(ServerFrame::from(result));
                break;
            }
            ClientFrame::Connect { .. } => Err(Error::Connection("already connected".into())),
        };
        let _ = frames.send(ServerFrame::from(result));
    }

    drop(connection);
    drop(frames);
    let _ = forward.await;
    let _ = writer.await;
    Ok(())
}

async fn write_frames(
    mut write: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<ServerFrame>,
) -> Result<()> {
    while let Some(frame) = frames.recv().await {
        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');
        write.write_all(line.as_bytes()).await?;
    }
    write.shutdown().await?;
    Ok(())
}

/// Reply slots in request order; `None` once the daemon connection is gone.
type Pending = Arc<Mutex<Option<VecDeque<oneshot::Sender<std::result::Result<(), String>>>>>>;

/// A connection to a daemon served by [`serve`].
pub struct TcpConnection {
    member: MemberId,
    writer: AsyncMutex<OwnedWriteHalf>,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl TcpConnection {
    pub async fn connect(
        addr: impl ToSocketAddrs,
        name: impl Into<String>,
    ) -> Result<(TcpConnection, EventStream)> {
        let name = name.into();
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        send_frame(&mut write, &ClientFrame::Connect { name: name.clone() }).await?;
        match lines.next_line().await? {
            Some(line) => match serde_json::from_str::<ServerFrame>(&line)? {
                ServerFrame::Ok => {}
                ServerFrame::Error { reason } => return Err(Error::Connection(reason)),
                ServerFrame::Event(_) => {
                    return Err(Error::Connection("event before handshake".into()))
                }
            },
            None => return Err(Error::Connection("daemon closed the connection".into())),
        }

        let pending: Pending = Arc::new(Mutex::new(Some(VecDeque::new())));
        let (events, stream) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(lines.into_inner(), events, pending.clone()));
        let connection = TcpConnection {
            member: MemberId::new(name),
            writer: AsyncMutex::new(write),
            pending,
            reader,
        };
        Ok((connection, stream))
    }

    async fn request(
        &self,
        frame: ClientFrame,
        rejected: impl FnOnce(String) -> Error,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        {
            // Queue the reply slot under the writer lock so slots match wire order
            let mut writer = self.writer.lock().await;
            self.pending
                .lock()
                .map_err(|_| Error::Disconnected)?
                .as_mut()
                .ok_or(Error::Disconnected)?
                .push_back(reply);
            send_frame(&mut writer, &frame).await?;
        }
        match response.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(rejected(reason)),
            Err(_) => Err(Error::Disconnected),
        }
    }
}

impl GroupConnection for TcpConnection {
    fn member(&self) -> &MemberId {
        &self.member
    }

    async fn join(&self, group: &str) -> Result<()> {
        let frame = ClientFrame::Join {
            group: group.to_string(),
        };
        self.request(frame, |reason| Error::Group {
            group: group.to_string(),
            reason,
        })
        .await
    }

    async fn leave(&self, group: &str) -> Result<()> {
        let frame = ClientFrame::Leave {
            group: group.to_string(),
        };
        self.request(frame, |reason| Error::Group {
            group: group.to_string(),
            reason,
        })
        .await
    }

    async fn multicast(&self, group: &str, guarantee: Guarantee, payload: Vec<u8>) -> Result<()> {
        let frame = ClientFrame::Multicast {
            group: group.to_string(),
            guarantee,
            payload,
        };
        self.request(frame, |reason| Error::Multicast {
            group: group.to_string(),
            reason,
        })
        .await
    }

    async fn disconnect(&self) -> Result<()> {
        self.request(ClientFrame::Disconnect, Error::Connection).await
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn send_frame(write: &mut OwnedWriteHalf, frame: &ClientFrame) -> Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn read_frames(
    read: BufReader<OwnedReadHalf>,
    events: mpsc::UnboundedSender<GroupEvent>,
    pending: Pending,
) {
    let mut lines = read.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "daemon read failed");
                break;
            }
        };
        let frame = match serde_json::from_str::<ServerFrame>(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                continue;
            }
        };
        let reply = match frame {
            ServerFrame::Event(event) => {
                let _ = events.send(event);
                continue;
            }
            ServerFrame::Ok => Ok(()),
            ServerFrame::Error { reason } => Err(reason),
        };
        let slot = pending
            .lock()
            .ok()
            .and_then(|mut slots| slots.as_mut().and_then(VecDeque::pop_front));
        match slot {
            Some(slot) => {
                let _ = slot.send(reply);
            }
            None => warn!("reply without a pending request"),
        }
    }
    debug!("daemon connection closed");
    // Outstanding requests fail once their reply slots are dropped
    if let Ok(mut slots) = pending.lock() {
        slots.take();
    }
}
