//! Makes one [`UdpConnection`] appear continuously usable across the
//! reconnects a voice session performs.
//!
//! A one-permit semaphore is the pause lock: while the session holds it
//! (pause → dial → unpause), user reads and writes queue instead of failing.
//! A separate stop flag ends the manager for good.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::udp::{OwnedPacket, UdpConnection};
use crate::signal::Flag;
use crate::{Error, Result};

struct Inner {
    /// The pause lock. Pausing holds the sole permit.
    pause: Arc<Semaphore>,
    held: StdMutex<Option<OwnedSemaphorePermit>>,
    /// The current connection; replaced by redials. The mutex also keeps a
    /// swap from landing under an in-flight read or write.
    conn: Arc<Mutex<Option<UdpConnection>>>,
    /// Tripped by close; never reset.
    stop: Flag,
    dialing: StdMutex<bool>,
    /// Persisted across dials, applied to each new connection.
    frequency: StdMutex<Option<(Duration, u32)>>,
}

/// Pause/redial/resume lifecycle around a voice UDP connection, safe for
/// concurrent readers and writers.
#[derive(Clone)]
pub struct UdpManager {
    inner: Arc<Inner>,
}

impl Default for UdpManager {
    fn default() -> Self {
        UdpManager::new()
    }
}

impl UdpManager {
    pub fn new() -> UdpManager {
        UdpManager {
            inner: Arc::new(Inner {
                pause: Arc::new(Semaphore::new(1)),
                held: StdMutex::new(None),
                conn: Arc::new(Mutex::new(None)),
                stop: Flag::new(),
                dialing: StdMutex::new(false),
                frequency: StdMutex::new(None),
            }),
        }
    }

    /// Acquire the pause lock, queueing user reads and writes.
    ///
    /// Blocks until in-flight operations release the lock; an active socket
    /// IO is never interrupted.
    pub async fn pause(&self, cancel: &Flag) -> Result<()> {
        if self.inner.stop.is_triggered() {
            return Err(Error::ManagerClosed);
        }
        {
            let held = self.inner.held.lock().expect("manager lock poisoned");
            if held.is_some() {
                return Err(Error::Other("manager already paused"));
            }
        }

        let permit = tokio::select! {
            permit = self.inner.pause.clone().acquire_owned() => {
                permit.map_err(|_| Error::ManagerClosed)?
            }
            _ = cancel.triggered() => return Err(Error::Cancelled),
            _ = self.inner.stop.triggered() => return Err(Error::ManagerClosed),
        };
        *self.inner.held.lock().expect("manager lock poisoned") = Some(permit);
        Ok(())
    }

    /// Release the pause lock; queued reads and writes resume.
    pub fn unpause(&self) {
        self.inner.held.lock().expect("manager lock poisoned").take();
    }

    /// Whether the manager is currently paused.
    pub fn is_paused(&self) -> bool {
        self.inner
            .held
            .lock()
            .expect("manager lock poisoned")
            .is_some()
    }

    /// Dial a new media connection, replacing the current one.
    ///
    /// Requires the manager to be paused and no dial in flight. Returns the
    /// externally visible (address, port) from IP discovery.
    pub async fn dial(&self, cancel: &Flag, addr: SocketAddr, ssrc: u32) -> Result<(String, u16)> {
        if self.inner.stop.is_triggered() {
            return Err(Error::ManagerClosed);
        }
        if !self.is_paused() {
            return Err(Error::Other("dial requires the manager to be paused"));
        }
        {
            let mut dialing = self.inner.dialing.lock().expect("manager lock poisoned");
            if *dialing {
                return Err(Error::Other("dial already in flight"));
            }
            *dialing = true;
        }
        let _guard = DialGuard(self.inner.clone());

        let mut conn = tokio::select! {
            dialed = UdpConnection::dial(addr, ssrc) => dialed?,
            _ = cancel.triggered() => return Err(Error::Cancelled),
            _ = self.inner.stop.triggered() => return Err(Error::ManagerClosed),
        };

        if let Some((frame_time, incr)) =
            *self.inner.frequency.lock().expect("manager lock poisoned")
        {
            conn.reset_frequency(frame_time, incr);
        }

        let (ip, port) = {
            let (ip, port) = conn.gateway_addr();
            (ip.to_owned(), port)
        };
        debug!(%ip, port, "voice UDP redialed");

        let mut current = self.inner.conn.lock().await;
        if let Some(old) = current.take() {
            old.close();
        }
        *current = Some(conn);
        Ok((ip, port))
    }

    /// Install the media secret on the current connection.
    pub async fn use_secret(&self, key: [u8; 32]) -> Result<()> {
        let mut conn = self.inner.conn.lock().await;
        match conn.as_mut() {
            Some(conn) => {
                conn.use_secret(key);
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    /// Set pacing on the current connection and persist it for future dials.
    pub async fn reset_frequency(&self, frame_time: Duration, timestamp_incr: u32) {
        *self.inner.frequency.lock().expect("manager lock poisoned") =
            Some((frame_time, timestamp_incr));
        if let Some(conn) = self.inner.conn.lock().await.as_mut() {
            conn.reset_frequency(frame_time, timestamp_incr);
        }
    }

    /// Write one opaque frame through the current connection.
    ///
    /// Blocks while the manager is paused and resumes against whatever
    /// connection exists afterwards; returns [`Error::ManagerClosed`] once
    /// the manager is closed.
    pub async fn write(&self, frame: &[u8]) -> Result<usize> {
        let mut guard = self.checkout().await?;
        let conn = guard.as_mut().ok_or(Error::NotConnected)?;
        tokio::select! {
            written = conn.write(frame) => written,
            _ = self.inner.stop.triggered() => Err(Error::ManagerClosed),
        }
    }

    /// Read one packet through the current connection.
    ///
    /// The packet is copied out of the connection's buffer, since the
    /// connection may be replaced before the caller is done with it.
    pub async fn read_packet(&self) -> Result<OwnedPacket> {
        let mut guard = self.checkout().await?;
        let conn = guard.as_mut().ok_or(Error::NotConnected)?;
        tokio::select! {
            packet = conn.read_packet() => packet.map(|p| p.to_owned()),
            _ = self.inner.stop.triggered() => Err(Error::ManagerClosed),
        }
    }

    /// Send the UDP keepalive on the current connection.
    pub async fn keepalive(&self) -> Result<()> {
        let guard = self.checkout().await?;
        match guard.as_ref() {
            Some(conn) => conn.keepalive().await,
            None => Err(Error::NotConnected),
        }
    }

    /// Wait at the pause lock, then take the connection mutex.
    ///
    /// The permit drops as soon as the connection guard is held: a pause
    /// starting mid-IO queues behind the connection mutex, so it can never
    /// swap the socket out from under an active operation.
    async fn checkout(&self) -> Result<OwnedMutexGuard<Option<UdpConnection>>> {
        if self.inner.stop.is_triggered() {
            return Err(Error::ManagerClosed);
        }
        let permit = tokio::select! {
            permit = self.inner.pause.clone().acquire_owned() => {
                permit.map_err(|_| Error::ManagerClosed)?
            }
            _ = self.inner.stop.triggered() => return Err(Error::ManagerClosed),
        };
        let guard = self.inner.conn.clone().lock_owned().await;
        drop(permit);
        Ok(guard)
    }

    /// Close the manager: cancels any in-flight dial, wakes every queued
    /// and in-flight operation, and closes the current connection. Further
    /// operations return [`Error::ManagerClosed`].
    pub fn close(&self) {
        self.inner.stop.trigger();
        self.inner.pause.close();
        if let Ok(mut conn) = self.inner.conn.try_lock() {
            if let Some(conn) = conn.take() {
                conn.close();
            }
        }
    }
}

struct DialGuard(Arc<Inner>);

impl Drop for DialGuard {
    fn drop(&mut self) {
        *self.0.dialing.lock().expect("manager lock poisoned") = false;
    }
}
