// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::error::Code;
use crate::protocol::{CommHeader, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ConnectionEstablished,
    Disconnect,
    Message,
    Timer,
    Error,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::ConnectionEstablished => "CONNECTION_ESTABLISHED",
            EventType::Disconnect => "DISCONNECT",
            EventType::Message => "MESSAGE",
            EventType::Timer => "TIMER",
            EventType::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// The unit delivered to a `DispatchHandler`.
///
/// Events are immutable once built and shared as `EventPtr`; the payload is a
/// reference-counted `Bytes` so handing an event to a worker thread never
/// copies the message body.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    /// Remote peer, absent for timer events.
    pub addr: Option<SocketAddr>,
    /// Local socket the message arrived on (datagram events).
    pub local_addr: Option<SocketAddr>,
    pub header: Option<CommHeader>,
    pub payload: Bytes,
    pub error: Code,
    pub error_msg: Option<String>,
    pub arrival_time: Instant,
}

pub type EventPtr = Arc<Event>;

impl Event {
    fn base(event_type: EventType, addr: Option<SocketAddr>) -> Event {
        Event {
            event_type,
            addr,
            local_addr: None,
            header: None,
            payload: Bytes::new(),
            error: Code::Ok,
            error_msg: None,
            arrival_time: Instant::now(),
        }
    }

    pub fn connection_established(addr: SocketAddr) -> Event {
        Event::base(EventType::ConnectionEstablished, Some(addr))
    }

    pub fn disconnect(addr: SocketAddr, error: Code) -> Event {
        Event {
            error,
            ..Event::base(EventType::Disconnect, Some(addr))
        }
    }

    pub fn message(addr: SocketAddr, msg: Message) -> Event {
        Event {
            header: Some(msg.header),
            payload: msg.payload,
            ..Event::base(EventType::Message, Some(addr))
        }
    }

    pub fn datagram(
        addr: SocketAddr,
        local_addr: SocketAddr,
        msg: Message,
    ) -> Event {
        Event {
            local_addr: Some(local_addr),
            ..Event::message(addr, msg)
        }
    }

    pub fn timer() -> Event {
        Event::base(EventType::Timer, None)
    }

    pub fn error(addr: Option<SocketAddr>, error: Code, msg: Option<String>) -> Event {
        Event {
            error,
            error_msg: msg,
            ..Event::base(EventType::Error, addr)
        }
    }

    pub fn into_ptr(self) -> EventPtr {
        Arc::new(self)
    }

    pub fn command(&self) -> Option<u16> {
        self.header.map(|h| h.command)
    }

    pub fn gid(&self) -> u32 {
        self.header.map(|h| h.gid).unwrap_or(0)
    }

    /// Milliseconds left before the sender stops waiting for a reply.
    pub fn expiration_remaining_ms(&self) -> Option<u64> {
        let header = self.header?;
        if header.timeout_ms == 0 {
            return None;
        }
        let elapsed = self.arrival_time.elapsed().as_millis() as u64;
        Some(u64::from(header.timeout_ms).saturating_sub(elapsed))
    }

    pub fn is_expired(&self) -> bool {
        self.expiration_remaining_ms() == Some(0)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event: type={}", self.event_type)?;
        if let Some(addr) = self.addr {
            write!(f, " from={}", addr)?;
        }
        match self.event_type {
            EventType::Message => {
                if let Some(h) = self.header {
                    write!(
                        f,
                        " version={} flags={:#04x} gid={} command={} \
                         total_len={} timeout_ms={}",
                        h.version,
                        h.flags,
                        h.gid,
                        h.command,
                        h.total_len,
                        h.timeout_ms
                    )?;
                }
            }
            EventType::Error | EventType::Disconnect => {
                write!(f, " \"{}\"", self.error)?;
                if let Some(msg) = &self.error_msg {
                    write!(f, " {}", msg)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
