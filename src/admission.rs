// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2024 RemasteredArch
//
// This file is part of smtp_intake.
//
// smtp_intake is free software: you can redistribute it and/or modify it under the terms of the
// GNU Affero General Public License as published by the Free Software Foundation, either version
// 3 of the License, or (at your option) any later version.
//
// smtp_intake is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See
// the GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License along with
// smtp_intake. If not, see <https://www.gnu.org/licenses/>.

//! Connection admission control.
//!
//! A fixed pool of [`Slot`]s bounds how many connections run at once. The accept loop takes a slot
//! *before* calling `accept`, so when the pool is empty the server simply stops accepting and the
//! kernel backlog absorbs new clients until a running connection ends.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{OwnedSemaphorePermit, Semaphore},
};

use crate::error::ServerError;

/// A bounded pool of connection slots.
///
/// Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct Admission {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl Admission {
    /// Create a pool of `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    ///
    /// Returns `None` once [`Self::close`] has been called.
    pub async fn acquire(&self) -> Option<Slot> {
        let permit = Arc::clone(&self.slots).acquire_owned().await.ok()?;

        Some(Slot { _permit: permit })
    }

    /// Stop handing out slots. Waiting and future [`Self::acquire`] calls return `None`; slots
    /// already held stay valid until dropped.
    pub fn close(&self) {
        self.slots.close();
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Slots currently held, i.e. running connections.
    pub fn active(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

/// One unit of connection capacity.
///
/// Released back to the pool when dropped, which happens exactly once however the connection
/// ends, including a panic in its task.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

/// A TCP listener that only accepts while a [`Slot`] is free.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    admission: Admission,
}

impl Listener {
    /// Bind to `address`.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(address: &str, admission: Admission) -> Result<Self, ServerError> {
        let inner = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.to_string(),
                source,
            })?;

        Ok(Self::new(inner, admission))
    }

    /// Wrap an already bound listener.
    pub fn new(inner: TcpListener, admission: Admission) -> Self {
        if let Ok(address) = inner.local_addr() {
            tracing::info!(
                %address,
                max_connections = admission.capacity(),
                "Listener bound"
            );
        }

        Self { inner, admission }
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This waits while every slot is held. The returned [`Slot`] must be kept for the
    /// connection's lifetime. Returns `Ok(None)` once the [`Admission`] pool is closed.
    ///
    /// # Errors
    ///
    /// I/O errors from [`TcpListener::accept`]. The slot taken for the attempt is released.
    pub async fn accept(&self) -> std::io::Result<Option<(TcpStream, SocketAddr, Slot)>> {
        // Acquire the slot first (backpressure).
        let Some(slot) = self.admission.acquire().await else {
            return Ok(None);
        };

        let (stream, peer) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %peer,
            available_slots = self.admission.available(),
            "Connection accepted"
        );

        Ok(Some((stream, peer, slot)))
    }

    /// Get the local address this listener is bound to.
    ///
    /// # Errors
    ///
    /// See [`TcpListener::local_addr`].
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub const fn admission(&self) -> &Admission {
        &self.admission
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_slots_are_bounded_and_released() {
        let admission = Admission::new(2);

        let first = admission.acquire().await;
        let second = admission.acquire().await;
        assert!(first.is_some() && second.is_some());
        assert_eq!(admission.active(), 2);

        // The third waits for one of the first two.
        let third = tokio::time::timeout(Duration::from_millis(50), admission.acquire()).await;
        assert!(third.is_err());

        drop(first);
        assert_eq!(admission.active(), 1);

        let third = tokio::time::timeout(Duration::from_millis(50), admission.acquire()).await;
        assert!(matches!(third, Ok(Some(_))));
        assert_eq!(admission.active(), 2);
    }

    #[tokio::test]
    async fn test_slot_released_when_task_panics() {
        let admission = Admission::new(1);
        let slot = admission.acquire().await;

        let task = tokio::spawn(async move {
            let _slot = slot;
            panic!("connection task failed");
        });
        assert!(task.await.is_err());

        assert_eq!(admission.available(), 1);
    }

    #[tokio::test]
    async fn test_close_stops_acquisition() {
        let admission = Admission::new(1);
        let held = admission.acquire().await;
        assert!(held.is_some());

        admission.close();
        assert!(admission.acquire().await.is_none());
    }
}
