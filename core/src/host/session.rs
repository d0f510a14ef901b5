//! Host-side sessions and SSE connections.
//!
//! Sessions and connections are separate collections, each behind its own lock.
//! When both are needed, take `connections` before `replay`.

use super::http::format_sse_event;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub protocol_version: String,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn create(&self, protocol_version: &str) -> Session {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            protocol_version: protocol_version.to_string(),
        };
        lock(&self.sessions).insert(session.id.clone(), session.clone());
        debug!(target: "mcp_host", session = %session.id, "Session created");
        session
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        lock(&self.sessions).get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.sessions).contains_key(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        lock(&self.sessions).remove(id).is_some()
    }

    pub fn clear(&self) {
        lock(&self.sessions).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An open `GET /mcp` event stream
pub struct SseConnection {
    pub stream: TcpStream,
    pub session_id: Option<String>,
    pub last_event_id: u64,
    pub active: bool,
}

impl SseConnection {
    fn send(&mut self, id: u64, frame: &str) {
        if !self.active {
            return;
        }
        let written = self
            .stream
            .write_all(frame.as_bytes())
            .and_then(|_| self.stream.flush());
        match written {
            Ok(()) => self.last_event_id = id,
            Err(e) => {
                debug!(target: "mcp_host", error = %e, "SSE write failed; deactivating connection");
                self.active = false;
            }
        }
    }
}

/// Fan-out of server notifications to SSE connections, with a bounded replay buffer
pub struct SseHub {
    connections: Mutex<Vec<SseConnection>>,
    replay: Mutex<VecDeque<(u64, String)>>,
    next_event_id: AtomicU64,
    replay_capacity: usize,
}

impl SseHub {
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            replay: Mutex::new(VecDeque::new()),
            next_event_id: AtomicU64::new(1),
            replay_capacity,
        }
    }

    /// Register a stream whose headers were already written, replaying events
    /// newer than `last_event_id`.
    ///
    /// Replay is written with no lock held. The connection joins the broadcast
    /// list only once no newer event is left to replay, so nothing is skipped.
    pub fn attach(&self, stream: TcpStream, session_id: Option<String>, last_event_id: Option<u64>) {
        let mut conn = SseConnection {
            stream,
            session_id,
            last_event_id: last_event_id.unwrap_or(0),
            active: true,
        };
        let Some(mut cursor) = last_event_id else {
            lock(&self.connections).push(conn);
            return;
        };
        loop {
            for (id, frame) in self.replay_after(cursor) {
                conn.send(id, &frame);
                cursor = id;
            }
            if !conn.active {
                return;
            }
            let mut connections = lock(&self.connections);
            let caught_up = lock(&self.replay)
                .back()
                .map_or(true, |(newest, _)| *newest <= cursor);
            if caught_up {
                connections.push(conn);
                return;
            }
        }
    }

    fn replay_after(&self, after: u64) -> Vec<(u64, String)> {
        lock(&self.replay)
            .iter()
            .filter(|(id, _)| *id > after)
            .cloned()
            .collect()
    }

    /// Write `data` as one event to every active connection; returns deliveries
    pub fn broadcast(&self, data: &str) -> usize {
        let mut connections = lock(&self.connections);
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let frame = format_sse_event(Some(id), data);
        {
            let mut replay = lock(&self.replay);
            replay.push_back((id, frame.clone()));
            while replay.len() > self.replay_capacity {
                replay.pop_front();
            }
        }

        let mut delivered = 0;
        for conn in connections.iter_mut() {
            conn.send(id, &frame);
            if conn.active {
                delivered += 1;
            }
        }
        connections.retain(|c| c.active);
        delivered
    }

    pub fn close_session(&self, session_id: &str) {
        let mut connections = lock(&self.connections);
        connections.retain(|c| {
            if c.session_id.as_deref() == Some(session_id) {
                let _ = c.stream.shutdown(Shutdown::Both);
                false
            } else {
                true
            }
        });
    }

    pub fn close_all(&self) {
        let mut connections = lock(&self.connections);
        for conn in connections.drain(..) {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.connections).iter().filter(|c| c.active).count()
    }

    pub fn last_event_id(&self) -> u64 {
        self.next_event_id.load(Ordering::SeqCst).saturating_sub(1)
    }
}
