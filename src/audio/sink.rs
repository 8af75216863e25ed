//! # Playback Sink
//!
//! Owns every interaction with the external audio player. Two shapes of
//! playback are offered:
//!
//! - **Streaming** ([`PlaybackSink::open_stream`]): the player reads a
//!   WebM/Opus stream from its stdin. Frames are handed to a writer task
//!   through a bounded channel so the caller never blocks on the pipe.
//! - **Whole file** ([`FilePlayer::play`]): the player is run on a file and
//!   awaited until it exits.
//!
//! In dry-run mode both shapes only log what they would have done.

use crate::config::PlaybackConfig;
use futures_util::future::BoxFuture;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Frames buffered between a broadcaster and the player's stdin.
const STREAM_BACKLOG: usize = 256;

#[derive(Debug)]
pub enum SinkError {
    /// The player executable is not installed.
    NotFound(String),
    Spawn(io::Error),
    Exited(ExitStatus),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::NotFound(program) => write!(
                f,
                "{} not found. Install ffmpeg: sudo apt install ffmpeg",
                program
            ),
            SinkError::Spawn(err) => write!(f, "Failed to start player: {}", err),
            SinkError::Exited(status) => write!(f, "Player exited with {}", status),
        }
    }
}

impl std::error::Error for SinkError {}

/// Outcome of handing one chunk to an open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Ok,
    /// The player is gone; the stream should be ended.
    Broken,
}

/// Plays complete audio files, one at a time.
pub trait FilePlayer: Send + Sync {
    fn play<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), SinkError>>;
}

#[derive(Debug, Clone)]
pub struct PlaybackSink {
    config: PlaybackConfig,
}

impl PlaybackSink {
    pub fn new(config: PlaybackConfig) -> Self {
        Self { config }
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Speech-oriented cleanup applied to everything played: rumble cut,
    /// gentle compression, user gain, then a hard limiter before stereo upmix.
    pub fn filter_chain(&self) -> String {
        format!(
            "highpass=f=80,\
             acompressor=threshold=-18dB:ratio=3:attack=5:release=100:makeup=2dB,\
             volume={},\
             alimiter=limit=1:attack=5:release=50,\
             aformat=channel_layouts=stereo",
            self.config.volume_boost
        )
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.player);
        cmd.args(["-nodisp", "-autoexit", "-loglevel", "error"])
            .arg("-af")
            .arg(self.filter_chain())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(device) = self.config.device() {
            cmd.env("AUDIODEV", device);
        }

        cmd
    }

    /// Start a player that reads a live stream from stdin.
    pub fn open_stream(&self) -> Result<StreamHandle, SinkError> {
        if self.config.dry_run {
            info!("Dry run: live stream will be discarded");
            return Ok(StreamHandle::new(Output::Discard, self.config.stop_grace()));
        }

        let mut cmd = self.command();
        cmd.args(["-fflags", "nobuffer", "-flags", "low_delay", "pipe:0"])
            .stdin(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| spawn_error(&self.config.player, err))?;

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.start_kill();
                return Err(SinkError::Spawn(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "player stdin unavailable",
                )));
            }
        };

        let (frames, rx) = mpsc::channel(STREAM_BACKLOG);
        tokio::spawn(pump(stdin, rx));

        debug!(pid = ?child.id(), "Player started for live stream");
        Ok(StreamHandle::new(
            Output::Process { frames, child },
            self.config.stop_grace(),
        ))
    }

    /// Play one file and wait for the player to finish.
    pub async fn play_file(&self, path: &Path) -> Result<(), SinkError> {
        if self.config.dry_run {
            info!(path = %path.display(), "Dry run: skipping playback");
            return Ok(());
        }

        let mut cmd = self.command();
        cmd.arg(path).stdin(Stdio::null());

        let status = cmd
            .status()
            .await
            .map_err(|err| spawn_error(&self.config.player, err))?;

        if status.success() {
            Ok(())
        } else {
            Err(SinkError::Exited(status))
        }
    }
}

impl FilePlayer for PlaybackSink {
    fn play<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(self.play_file(path))
    }
}

fn spawn_error(program: &str, err: io::Error) -> SinkError {
    if err.kind() == io::ErrorKind::NotFound {
        SinkError::NotFound(program.to_string())
    } else {
        SinkError::Spawn(err)
    }
}

/// Copy queued frames into the player's stdin until the channel closes.
async fn pump(mut stdin: ChildStdin, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = frames.recv().await {
        if let Err(err) = stdin.write_all(&chunk).await {
            debug!(error = %err, "Player stdin closed");
            return;
        }
    }

    if let Err(err) = stdin.shutdown().await {
        debug!(error = %err, "Failed to close player stdin");
    }
}

/// Give the player `grace` to drain and exit after EOF, then kill it.
async fn reap(mut child: Child, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "Player exited"),
        Ok(Err(err)) => warn!(error = %err, "Failed to wait for player"),
        Err(_) => {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Player still running after stream end, killing it"
            );
            if let Err(err) = child.kill().await {
                warn!(error = %err, "Failed to kill player");
            }
        }
    }
}

enum Output {
    Process {
        frames: mpsc::Sender<Vec<u8>>,
        child: Child,
    },
    Discard,
}

/// An open live stream. Closing is idempotent and also happens on drop.
pub struct StreamHandle {
    output: Option<Output>,
    grace: Duration,
    bytes_fed: u64,
}

impl StreamHandle {
    fn new(output: Output, grace: Duration) -> Self {
        Self {
            output: Some(output),
            grace,
            bytes_fed: 0,
        }
    }

    pub fn bytes_fed(&self) -> u64 {
        self.bytes_fed
    }

    /// Hand one chunk to the player without waiting for it to be written.
    pub fn feed(&mut self, data: Vec<u8>) -> FeedStatus {
        let len = data.len() as u64;
        match &self.output {
            None => FeedStatus::Broken,
            Some(Output::Discard) => {
                self.bytes_fed += len;
                FeedStatus::Ok
            }
            Some(Output::Process { frames, .. }) => match frames.try_send(data) {
                Ok(()) => {
                    self.bytes_fed += len;
                    FeedStatus::Ok
                }
                // a skipped chunk corrupts the container, so give up on the stream
                Err(TrySendError::Full(_)) => {
                    warn!(
                        backlog = frames.max_capacity(),
                        "Player is falling behind, ending stream"
                    );
                    FeedStatus::Broken
                }
                Err(TrySendError::Closed(_)) => FeedStatus::Broken,
            },
        }
    }

    pub fn close(&mut self) {
        match self.output.take() {
            None => {}
            Some(Output::Discard) => debug!(bytes = self.bytes_fed, "Dry run stream closed"),
            Some(Output::Process { frames, mut child }) => {
                // dropping the sender lets the writer task close stdin
                drop(frames);
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(reap(child, self.grace));
                    }
                    Err(_) => {
                        let _ = child.start_kill();
                    }
                }
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}
