//! Supervision of tasks spawned by stream handlers.
//!
//! Handlers may spawn worker tasks and register them against their stream
//! with [`Command::Spawn`](crate::handler::Command::Spawn). The connection
//! tracks each child so that exits route back to the owning handler as an
//! `info` message, and so that children die with their stream.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::trace;

use h3_machine::StreamId;

use crate::transport::ConnectionHandle;

static NEXT_CHILD_ID: AtomicU64 = AtomicU64::new(0);

/// Identifier of a monitored child task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildId(u64);

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Normal,
    Cancelled,
    Panic,
}

/// What to do with a child when its stream terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Abort immediately.
    BrutalKill,
    /// Let the child run for this long, then abort it.
    Timeout(Duration),
}

/// A spawned, monitored child task.
#[derive(Debug)]
pub struct ChildHandle {
    id: ChildId,
    abort: AbortHandle,
}

impl ChildHandle {
    pub fn id(&self) -> ChildId {
        self.id
    }
}

/// Spawns `future` on the current runtime and reports its exit to the
/// connection's inbox.
pub fn spawn_monitored<F>(conn: &ConnectionHandle, future: F) -> ChildHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let id = ChildId(NEXT_CHILD_ID.fetch_add(1, Ordering::Relaxed));
    let guard = DownGuard {
        conn: conn.clone(),
        id,
        completed: false,
    };
    let task = tokio::spawn(async move {
        let mut guard = guard;
        future.await;
        guard.completed = true;
    });
    ChildHandle {
        id,
        abort: task.abort_handle(),
    }
}

/// Posts the exit signal when the child's future is dropped, whether it ran
/// to completion, was aborted, or panicked.
struct DownGuard {
    conn: ConnectionHandle,
    id: ChildId,
    completed: bool,
}

impl Drop for DownGuard {
    fn drop(&mut self) {
        let reason = if self.completed {
            ExitReason::Normal
        } else if std::thread::panicking() {
            ExitReason::Panic
        } else {
            ExitReason::Cancelled
        };
        self.conn.child_down(self.id, reason);
    }
}

struct Child {
    /// `None` once the owning stream has terminated and the child is in its
    /// shutdown grace period.
    stream: Option<StreamId>,
    policy: ShutdownPolicy,
    abort: AbortHandle,
}

/// Result of looking up an exited child.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Down {
    /// The child was ours; `Some` names the stream still interested in it.
    Known(Option<StreamId>),
    Unknown,
}

#[derive(Default)]
pub(crate) struct Children {
    children: HashMap<ChildId, Child>,
}

impl Children {
    pub(crate) fn up(&mut self, stream: StreamId, handle: ChildHandle, policy: ShutdownPolicy) {
        self.children.insert(
            handle.id,
            Child {
                stream: Some(stream),
                policy,
                abort: handle.abort,
            },
        );
    }

    pub(crate) fn down(&mut self, id: ChildId) -> Down {
        match self.children.remove(&id) {
            Some(child) => Down::Known(child.stream),
            None => Down::Unknown,
        }
    }

    /// Applies shutdown policies to every child of `stream`.
    pub(crate) fn shutdown(&mut self, stream: StreamId) {
        self.children.retain(|id, child| {
            if child.stream != Some(stream) {
                return true;
            }
            match child.policy {
                ShutdownPolicy::BrutalKill => {
                    trace!(child = %id, "killing child");
                    child.abort.abort();
                    false
                }
                ShutdownPolicy::Timeout(grace) => {
                    child.stream = None;
                    let abort = child.abort.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        abort.abort();
                    });
                    true
                }
            }
        });
    }

    /// Stops every child; the connection is going down.
    pub(crate) fn shutdown_all(&mut self) {
        for (id, child) in self.children.drain() {
            match child.policy {
                ShutdownPolicy::BrutalKill => child.abort.abort(),
                ShutdownPolicy::Timeout(grace) => {
                    let abort = child.abort;
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        abort.abort();
                    });
                }
            }
            trace!(child = %id, "stopping child at connection shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::transport::Event;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Event<u64>>) {
        let (tx, rx) = mpsc::unbounded_channel::<Event<u64>>();
        (ConnectionHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn normal_exit_reports_down() {
        let (conn, mut rx) = handle();
        let child = spawn_monitored(&conn, async {});
        match rx.recv().await.unwrap() {
            Event::ChildDown { child: id, reason } => {
                assert_eq!(id, child.id());
                assert_eq!(reason, ExitReason::Normal);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn brutal_kill_aborts_and_reports_cancelled() {
        let (conn, mut rx) = handle();
        let stream = StreamId::new(1);
        let child = spawn_monitored(&conn, std::future::pending());
        let id = child.id();

        let mut children = Children::default();
        children.up(stream, child, ShutdownPolicy::BrutalKill);
        children.shutdown(stream);

        match rx.recv().await.unwrap() {
            Event::ChildDown { child, reason } => {
                assert_eq!(child, id);
                assert_eq!(reason, ExitReason::Cancelled);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // already removed by shutdown
        assert_eq!(children.down(id), Down::Unknown);
    }

    #[tokio::test]
    async fn down_after_stream_shutdown_is_anonymous() {
        let (conn, _rx) = handle();
        let stream = StreamId::new(1);
        let child = spawn_monitored(&conn, std::future::pending());
        let id = child.id();

        let mut children = Children::default();
        children.up(stream, child, ShutdownPolicy::Timeout(Duration::from_secs(5)));
        children.shutdown(stream);

        // entry survives the grace period, detached from its stream
        assert_eq!(children.down(id), Down::Known(None));
    }

    #[tokio::test]
    async fn live_child_maps_to_stream() {
        let (conn, _rx) = handle();
        let stream = StreamId::new(7);
        let child = spawn_monitored(&conn, std::future::pending());
        let id = child.id();

        let mut children = Children::default();
        children.up(stream, child, ShutdownPolicy::BrutalKill);
        assert_eq!(children.down(id), Down::Known(Some(stream)));
        assert_eq!(children.down(id), Down::Unknown);
    }
}
