// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Code, Error, Result};
use crate::protocol::CommBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
}

pub(crate) struct DataEntry {
    pub conn_id: u64,
    pub state: ConnectionState,
    pub outbound: mpsc::Sender<CommBuf>,
    pub token: CancellationToken,
}

pub(crate) struct AcceptEntry {
    pub token: CancellationToken,
}

pub(crate) struct DatagramEntry {
    pub socket: Arc<UdpSocket>,
    pub token: CancellationToken,
}

#[derive(Default)]
struct Inner {
    data: HashMap<SocketAddr, DataEntry>,
    accept: HashMap<SocketAddr, AcceptEntry>,
    datagram: HashMap<SocketAddr, DatagramEntry>,
    next_conn_id: u64,
}

/// Every live socket known to a `Comm`, keyed by address.
///
/// Stream connections are keyed by remote address, listeners and datagram
/// sockets by local address.  Connection ids let a handler that is tearing
/// down tell whether the entry it finds is still its own.
#[derive(Default)]
pub(crate) struct HandlerMap {
    inner: Mutex<Inner>,
}

/// What a sender needs to queue a message on a connection.
pub(crate) struct Route {
    pub conn_id: u64,
    pub outbound: mpsc::Sender<CommBuf>,
}

impl HandlerMap {
    pub fn new() -> HandlerMap {
        HandlerMap::default()
    }

    /// Registers a new stream connection in the CONNECTING state.  Returns
    /// `None` if `addr` already has one.
    pub fn insert_data(
        &self,
        addr: SocketAddr,
        outbound: mpsc::Sender<CommBuf>,
        token: CancellationToken,
    ) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.data.contains_key(&addr) {
            return None;
        }
        inner.next_conn_id += 1;
        let conn_id = inner.next_conn_id;
        inner.data.insert(
            addr,
            DataEntry {
                conn_id,
                state: ConnectionState::Connecting,
                outbound,
                token,
            },
        );
        Some(conn_id)
    }

    pub fn set_connected(&self, addr: &SocketAddr, conn_id: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.data.get_mut(addr) {
            Some(entry) if entry.conn_id == conn_id => {
                entry.state = ConnectionState::Connected;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, addr: &SocketAddr) -> Option<ConnectionState> {
        self.inner.lock().data.get(addr).map(|entry| entry.state)
    }

    pub fn route(&self, addr: &SocketAddr) -> Result<Route> {
        let inner = self.inner.lock();
        match inner.data.get(addr) {
            Some(entry) => Ok(Route {
                conn_id: entry.conn_id,
                outbound: entry.outbound.clone(),
            }),
            None => Err(Error::new(
                Code::CommNotConnected,
                format!("no connection to {}", addr),
            )),
        }
    }

    /// Removes the entry for `addr` only if it still belongs to `conn_id`.
    pub fn remove_data_if(
        &self,
        addr: &SocketAddr,
        conn_id: u64,
    ) -> Option<DataEntry> {
        let mut inner = self.inner.lock();
        match inner.data.get(addr) {
            Some(entry) if entry.conn_id == conn_id => inner.data.remove(addr),
            _ => None,
        }
    }

    pub fn remove_data(&self, addr: &SocketAddr) -> Option<DataEntry> {
        self.inner.lock().data.remove(addr)
    }

    pub fn insert_accept(&self, addr: SocketAddr, token: CancellationToken) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.accept.contains_key(&addr) {
            return Err(Error::new(
                Code::CommAlreadyConnected,
                format!("already listening on {}", addr),
            ));
        }
        inner.accept.insert(addr, AcceptEntry { token });
        Ok(())
    }

    pub fn remove_accept(&self, addr: &SocketAddr) -> Option<AcceptEntry> {
        self.inner.lock().accept.remove(addr)
    }

    pub fn insert_datagram(
        &self,
        addr: SocketAddr,
        socket: Arc<UdpSocket>,
        token: CancellationToken,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.datagram.contains_key(&addr) {
            return Err(Error::new(
                Code::CommAlreadyConnected,
                format!("datagram socket already bound to {}", addr),
            ));
        }
        inner.datagram.insert(addr, DatagramEntry { socket, token });
        Ok(())
    }

    pub fn datagram_socket(&self, addr: &SocketAddr) -> Result<Arc<UdpSocket>> {
        match self.inner.lock().datagram.get(addr) {
            Some(entry) => Ok(Arc::clone(&entry.socket)),
            None => Err(Error::new(
                Code::CommNotConnected,
                format!("no datagram socket bound to {}", addr),
            )),
        }
    }

    pub fn remove_datagram(&self, addr: &SocketAddr) -> Option<DatagramEntry> {
        self.inner.lock().datagram.remove(addr)
    }

    /// Empties the map, returning every cancellation token so the caller can
    /// stop the owning handlers outside the lock.
    pub fn drain(&self) -> Vec<CancellationToken> {
        let mut inner = self.inner.lock();
        let mut tokens = Vec::new();
        tokens.extend(inner.data.drain().map(|(_, e)| e.token));
        tokens.extend(inner.accept.drain().map(|(_, e)| e.token));
        tokens.extend(inner.datagram.drain().map(|(_, e)| e.token));
        tokens
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_teardown_keeps_newer_entry() {
        let map = HandlerMap::new();
        let addr: SocketAddr = "127.0.0.1:15860".parse().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let first = map
            .insert_data(addr, tx.clone(), CancellationToken::new())
            .unwrap();
        assert!(map.insert_data(addr, tx.clone(), CancellationToken::new()).is_none());
        assert_eq!(map.state(&addr), Some(ConnectionState::Connecting));
        assert!(map.set_connected(&addr, first));
        assert_eq!(map.state(&addr), Some(ConnectionState::Connected));

        assert!(map.remove_data_if(&addr, first).is_some());
        let second = map
            .insert_data(addr, tx, CancellationToken::new())
            .unwrap();
        assert_ne!(first, second);
        assert!(map.remove_data_if(&addr, first).is_none());
        assert_eq!(map.route(&addr).unwrap().conn_id, second);
    }

    #[test]
    fn unknown_address_is_not_connected() {
        let map = HandlerMap::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = map.route(&addr).err().unwrap();
        assert_eq!(err.code(), Code::CommNotConnected);
    }
}
