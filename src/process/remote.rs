//! Interactive shell on a remote host over SSH.
//!
//! One task owns the SSH channel. Writes, resizes and close requests reach it
//! over a command queue, so they are serialized against reads; writes carry a
//! oneshot reply so errors surface to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::BackingProcess;
use crate::config::LifecycleConfig;
use crate::error::ProcessError;
use crate::store::RemoteHost;

const OUTPUT_QUEUE: usize = 64;
const COMMAND_QUEUE: usize = 64;
const CLOSE_LIMIT: Duration = Duration::from_secs(5);

/// Everything needed to open a remote shell besides the host record.
pub struct RemoteSpawn<'a> {
    pub label: String,
    pub rows: u16,
    pub cols: u16,
    pub term: &'a str,
    pub connect_timeout: Duration,
}

enum Command {
    Write(Vec<u8>, oneshot::Sender<Result<(), ProcessError>>),
    Resize(u16, u16),
    Close(oneshot::Sender<()>),
}

pub struct RemoteShell {
    label: String,
    commands: mpsc::Sender<Command>,
    size: parking_lot::Mutex<(u16, u16)>,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Host key policy: pin to the stored fingerprint when there is one.
struct HostKeyCheck {
    label: String,
    fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let presented = server_public_key.fingerprint();
        match &self.fingerprint {
            Some(expected) => {
                let ok = expected.trim_start_matches("SHA256:") == presented;
                if !ok {
                    warn!("{}: host key mismatch (got SHA256:{presented})", self.label);
                }
                Ok(ok)
            }
            None => {
                info!("{}: accepting unpinned host key SHA256:{presented}", self.label);
                Ok(true)
            }
        }
    }
}

impl RemoteShell {
    /// Connect, authenticate, and start a shell on a PTY.
    pub async fn connect(
        host: &RemoteHost,
        opts: &RemoteSpawn<'_>,
    ) -> Result<(Self, mpsc::Receiver<Bytes>), ProcessError> {
        let target = format!("{}@{}:{}", host.username, host.address, host.port);
        let (session, channel) = tokio::time::timeout(opts.connect_timeout, open_shell(host, opts))
            .await
            .map_err(|_| ProcessError::ConnectTimeout(target.clone()))??;
        info!("{}: shell open on {target}", opts.label);

        let alive = Arc::new(AtomicBool::new(true));
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let task = tokio::spawn(channel_task(
            opts.label.clone(),
            session,
            channel,
            cmd_rx,
            out_tx,
            Arc::clone(&alive),
        ));

        Ok((
            Self {
                label: opts.label.clone(),
                commands: cmd_tx,
                size: parking_lot::Mutex::new((opts.rows, opts.cols)),
                alive,
                task,
            },
            out_rx,
        ))
    }
}

async fn open_shell(
    host: &RemoteHost,
    opts: &RemoteSpawn<'_>,
) -> Result<(Handle<HostKeyCheck>, Channel<Msg>), ProcessError> {
    let config = Arc::new(client::Config::default());
    let handler = HostKeyCheck {
        label: opts.label.clone(),
        fingerprint: host.fingerprint.clone(),
    };
    let mut session = client::connect(config, (host.address.as_str(), host.port), handler).await?;

    let authenticated = if let Some(key) = &host.private_key {
        let pair = russh_keys::decode_secret_key(key, host.key_passphrase.as_deref())?;
        session
            .authenticate_publickey(&host.username, Arc::new(pair))
            .await?
    } else if let Some(password) = &host.password {
        session.authenticate_password(&host.username, password).await?
    } else {
        false
    };
    if !authenticated {
        return Err(ProcessError::AuthRejected(format!(
            "{}@{}",
            host.username, host.address
        )));
    }

    let channel = session.channel_open_session().await?;
    channel
        .request_pty(
            false,
            opts.term,
            u32::from(opts.cols),
            u32::from(opts.rows),
            0,
            0,
            &[],
        )
        .await?;
    channel.request_shell(true).await?;
    Ok((session, channel))
}

async fn channel_task(
    label: String,
    session: Handle<HostKeyCheck>,
    mut channel: Channel<Msg>,
    mut commands: mpsc::Receiver<Command>,
    output: mpsc::Sender<Bytes>,
    alive: Arc<AtomicBool>,
) {
    let mut close_reply = None;
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Write(data, reply)) => {
                    let result = channel.data(&data[..]).await.map_err(ProcessError::from);
                    let _ = reply.send(result);
                }
                Some(Command::Resize(rows, cols)) => {
                    if let Err(e) = channel.window_change(u32::from(cols), u32::from(rows), 0, 0).await {
                        warn!("{label}: window change failed: {e}");
                    }
                }
                Some(Command::Close(reply)) => {
                    close_reply = Some(reply);
                    break;
                }
                None => break,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if output.send(Bytes::copy_from_slice(&data)).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("{label}: remote shell exited with {exit_status}");
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    alive.store(false, Ordering::Relaxed);
    let _ = channel.eof().await;
    let _ = channel.close().await;
    if let Err(e) = session
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await
    {
        debug!("{label}: disconnect: {e}");
    }
    debug!("{label}: channel task finished");
    if let Some(reply) = close_reply {
        let _ = reply.send(());
    }
}

impl BackingProcess for RemoteShell {
    async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Err(ProcessError::Dead);
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Write(data.to_vec(), tx))
            .await
            .map_err(|_| ProcessError::Dead)?;
        rx.await.map_err(|_| ProcessError::Dead)?
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), ProcessError> {
        {
            let mut size = self.size.lock();
            if *size == (rows, cols) {
                return Ok(());
            }
            *size = (rows, cols);
        }
        self.commands
            .send(Command::Resize(rows, cols))
            .await
            .map_err(|_| ProcessError::Dead)
    }

    async fn terminate(&self, _lifecycle: &LifecycleConfig) {
        let (tx, rx) = oneshot::channel();
        // The command queue may be full behind a stalled write.
        let close = async {
            if self.commands.send(Command::Close(tx)).await.is_ok() {
                let _ = rx.await;
            }
        };
        if tokio::time::timeout(CLOSE_LIMIT, close).await.is_err() {
            warn!("{}: remote close timed out", self.label);
        }
        self.alive.store(false, Ordering::Relaxed);
        self.task.abort();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed) && !self.task.is_finished()
    }
}

impl Drop for RemoteShell {
    fn drop(&mut self) {
        self.task.abort();
    }
}
