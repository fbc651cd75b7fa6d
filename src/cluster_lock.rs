//! The cluster lock: a process-wide advisory mutual-exclusion state
//! machine with four states (`FREE`, `READING`, `USING`, `LOAN`).
//!
//! The reference peer spins on a shared integer; this implementation
//! replaces the spin with a `tokio::sync::Notify`-guarded state variable
//! (§9 of the spec) and imposes a total order on peer addresses when
//! fanning out `LEND_LOCK`, aborting and retrying with jittered backoff on
//! any denial instead of deadlocking against a peer that is itself
//! waiting on us.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

use crate::error::PeerError;
use crate::peers::PeerRegistry;
use crate::wire::{self, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Reading,
    Using,
    Loan,
}

/// A guard that releases the lock back to `FREE` (or, for a read guard,
/// whatever state it returns it to) when dropped would be unsound across
/// `.await` points here, so release is explicit — callers must call
/// `release()` rather than relying on `Drop`, matching the fact that
/// release itself may need to notify peers (`RETURN_LOCK`).
pub struct ClusterLock {
    state: Mutex<LockState>,
    notify: Notify,
}

impl ClusterLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LockState::Free),
            notify: Notify::new(),
        })
    }

    async fn wait_until_free(&self) {
        loop {
            // Register for the next notification before checking state, not
            // after: notify_waiters() only wakes already-registered waiters,
            // so checking first would let a transition to FREE that happens
            // in the gap between the check and this call go unseen forever.
            let notified = self.notify.notified();
            {
                let state = self.state.lock().await;
                if *state == LockState::Free {
                    return;
                }
            }
            notified.await;
        }
    }

    async fn set(&self, new_state: LockState) {
        let mut state = self.state.lock().await;
        *state = new_state;
    }

    async fn release_to_free(&self) {
        {
            let mut state = self.state.lock().await;
            *state = LockState::Free;
        }
        self.notify.notify_waiters();
    }

    pub async fn current_state(&self) -> LockState {
        *self.state.lock().await
    }

    /// Local reader path (listing, planning downloads/uploads): wait for
    /// `FREE`, transition to `READING`. Caller must call
    /// [`ClusterLock::release_read`] when done.
    pub async fn acquire_read(&self) {
        self.wait_until_free().await;
        self.set(LockState::Reading).await;
    }

    pub async fn release_read(&self) {
        self.release_to_free().await;
    }

    /// Remote lend request: if `FREE`, transition to `LOAN` and return
    /// true (caller replies `ACK`); otherwise return false (caller replies
    /// with the NACK sentinel) without blocking.
    pub async fn try_loan(&self) -> bool {
        let mut state = self.state.lock().await;
        if *state == LockState::Free {
            *state = LockState::Loan;
            true
        } else {
            false
        }
    }

    pub async fn release_loan(&self) {
        self.release_to_free().await;
    }

    /// Local writer path (upload, delete): acquire the cluster-wide lock by
    /// lending it from every peer, in peer-address order, retrying the
    /// whole attempt with jittered backoff if any peer denies or is
    /// unreachable. Returns once this peer owns the logical cluster lock
    /// and has transitioned to `USING`.
    pub async fn acquire_write(&self, peers: &PeerRegistry) -> Result<()> {
        loop {
            self.wait_until_free().await;
            self.set(LockState::Using).await;

            match lend_from_all_peers(peers).await {
                Ok(()) => return Ok(()),
                Err((denied_by, granted)) => {
                    warn!("cluster lock denied by {}, retrying with backoff", denied_by);
                    return_loans(&granted).await;
                    self.release_to_free().await;
                    let jitter_ms = rand::thread_rng().gen_range(50..250);
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                }
            }
        }
    }

    /// Release the write lock: notify every peer via `RETURN_LOCK`, then
    /// transition back to `FREE`.
    pub async fn release_write(&self, peers: &PeerRegistry) {
        let granted = peers.snapshot().await;
        return_loans(&granted).await;
        self.release_to_free().await;
    }
}

/// Send `RETURN_LOCK` to every peer in `granted`, best-effort.
async fn return_loans(granted: &[String]) {
    for peer in granted {
        if let Err(err) = send_and_await_ack(peer, Opcode::ReturnLock).await {
            warn!("failed to return lock to {}: {:#}", peer, err);
        }
    }
}

/// Send `LEND_LOCK` to every peer, in ascending address order, awaiting an
/// `ACK` from each. On denial or unreachability, returns `Err((peer, granted))`
/// naming the peer that denied and the prefix of peers that had already
/// granted the loan and so must be sent `RETURN_LOCK` before retrying —
/// otherwise those peers stay stuck in `LOAN` forever and NACK every future
/// acquisition, livelocking the cluster on this lock.
async fn lend_from_all_peers(peers: &PeerRegistry) -> Result<(), (String, Vec<String>)> {
    let mut ordered = peers.snapshot().await;
    ordered.sort();

    let mut granted = Vec::with_capacity(ordered.len());
    for peer in &ordered {
        match send_and_await_ack(peer, Opcode::LendLock).await {
            Ok(()) => {
                debug!("{} granted the cluster lock", peer);
                granted.push(peer.clone());
            }
            Err(_) => return Err((peer.clone(), granted)),
        }
    }
    Ok(())
}

async fn send_and_await_ack(peer: &str, op: Opcode) -> Result<()> {
    let mut conn = TcpStream::connect(peer)
        .await
        .map_err(|_| PeerError::PeerUnreachable(peer.to_string()))?;
    wire::send_opcode(&mut conn, op).await?;
    let reply = wire::read_opcode(&mut conn).await;
    if reply == Opcode::Ack as u8 {
        Ok(())
    } else {
        Err(PeerError::LockDenied(peer.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_lock_round_trips_through_free() {
        let lock = ClusterLock::new();
        assert_eq!(lock.current_state().await, LockState::Free);
        lock.acquire_read().await;
        assert_eq!(lock.current_state().await, LockState::Reading);
        lock.release_read().await;
        assert_eq!(lock.current_state().await, LockState::Free);
    }

    #[tokio::test]
    async fn loan_is_refused_when_not_free() {
        let lock = ClusterLock::new();
        lock.acquire_read().await;
        assert!(!lock.try_loan().await);
        lock.release_read().await;
        assert!(lock.try_loan().await);
        assert_eq!(lock.current_state().await, LockState::Loan);
        lock.release_loan().await;
        assert_eq!(lock.current_state().await, LockState::Free);
    }
}
