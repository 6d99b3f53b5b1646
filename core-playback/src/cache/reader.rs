//! Blocking `Read + Seek` adapter over a [`StreamCacheManager`].
//!
//! Decoders that want a plain byte source (a file-like `MediaSource`) read
//! through this type. Reads block the calling thread until the bytes are
//! cached, so run it on a decoder thread or inside `spawn_blocking`, never
//! on an async worker.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::manager::StreamCacheManager;
use crate::error::PlaybackError;

pub struct CacheReader {
    manager: Arc<StreamCacheManager>,
    position: u64,
    poll_interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CacheReader {
    pub fn new(manager: Arc<StreamCacheManager>) -> Self {
        let config = manager.config();
        let poll_interval = config.health_poll_interval;
        let timeout = config.read_wait_timeout;
        Self {
            manager,
            position: 0,
            poll_interval,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort blocked reads when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> u64 {
        self.manager.descriptor().total_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn manager(&self) -> &Arc<StreamCacheManager> {
        &self.manager
    }
}

impl Read for CacheReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.len() {
            return Ok(0);
        }

        let started = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Err(io::Error::other(PlaybackError::Cancelled));
            }

            let n = self.manager.read(self.position, buf);
            if n > 0 {
                self.position += n as u64;
                self.manager.update_playback_position(self.position);
                return Ok(n);
            }

            if started.elapsed() >= self.timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    PlaybackError::Timeout(format!("no data at offset {}", self.position)),
                ));
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl Seek for CacheReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => len + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }

        let target = target.min(len) as u64;
        if target != self.position {
            trace!(from = self.position, to = target, "Reader seek");
            self.manager.prepare_seek(target);
            self.position = target;
        }
        Ok(target)
    }
}

impl std::fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReader")
            .field("resource_id", &self.manager.resource_id())
            .field("position", &self.position)
            .finish()
    }
}
