//! Per-entity reader/writer locks. Collections and documents share one id
//! space, so a single map of locks coordinates both. Readers coexist, a
//! writer is exclusive, and waiters are served in FIFO order so writers are
//! not starved by a stream of readers. Lock ownership is per thread and
//! reentrant; a reader that is alone on an entity may upgrade to writer.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use log::warn;

#[derive(Debug, Default)]
pub(crate) struct LockManager {
    locks: Mutex<HashMap<u32, Arc<EntityLock>>>,
}

impl LockManager {
    pub fn new() -> LockManager {
        LockManager::default()
    }

    /// Blocks until a shared lock on `id` is held by the calling thread.
    pub fn read(&self, id: u32) -> ReadGuard {
        let lock = self.entity(id);
        lock.acquire_read();
        ReadGuard { lock, _not_send: PhantomData }
    }

    /// Blocks until the calling thread is the exclusive holder of `id`.
    pub fn write(&self, id: u32) -> WriteGuard {
        let lock = self.entity(id);
        lock.acquire_write();
        WriteGuard { lock, _not_send: PhantomData }
    }

    /// Forgets the lock of a deleted entity. Outstanding guards stay valid;
    /// they hold the lock itself, not the map entry.
    pub fn remove(&self, id: u32) {
        self.locks.lock().unwrap().remove(&id);
    }

    fn entity(&self, id: u32) -> Arc<EntityLock> {
        self.locks.lock().unwrap().entry(id).or_default().clone()
    }
}

#[derive(Debug, Default)]
struct EntityLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    readers: HashMap<ThreadId, u32>,
    writer: Option<(ThreadId, u32)>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    ticket: u64,
    exclusive: bool,
}

impl LockState {
    fn enqueue(&mut self, exclusive: bool) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.queue.push_back(Waiter { ticket, exclusive });
        ticket
    }

    fn dequeue(&mut self, ticket: u64) {
        self.queue.retain(|w| w.ticket != ticket);
    }

    fn exclusive_ahead_of(&self, ticket: u64) -> bool {
        self.queue.iter().any(|w| w.ticket < ticket && w.exclusive)
    }

    fn anyone_ahead_of(&self, ticket: u64) -> bool {
        self.queue.iter().any(|w| w.ticket < ticket)
    }
}

impl EntityLock {
    fn acquire_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        // Reentrant reads, and reads by the current writer, must never wait.
        let held = state.readers.contains_key(&me)
            || state.writer.map_or(false, |(owner, _)| owner == me);
        if held {
            *state.readers.entry(me).or_insert(0) += 1;
            return;
        }

        let ticket = state.enqueue(false);
        while state.writer.is_some() || state.exclusive_ahead_of(ticket) {
            state = self.cond.wait(state).unwrap();
        }
        state.dequeue(ticket);
        state.readers.insert(me, 1);
        // the grant may have unblocked the reader queued right behind us
        self.cond.notify_all();
    }

    fn acquire_write(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        if let Some((owner, count)) = &mut state.writer {
            if *owner == me {
                *count += 1;
                return;
            }
        }

        if state.readers.contains_key(&me) {
            // Upgrade: permitted once every other reader has left. The
            // upgrade does not queue, otherwise it would sit behind a writer
            // that in turn waits for our read lock to go away.
            while state.writer.is_some() || state.readers.len() > 1 {
                state = self.cond.wait(state).unwrap();
            }
            state.writer = Some((me, 1));
            return;
        }

        let ticket = state.enqueue(true);
        while state.writer.is_some() || !state.readers.is_empty() || state.anyone_ahead_of(ticket) {
            state = self.cond.wait(state).unwrap();
        }
        state.dequeue(ticket);
        state.writer = Some((me, 1));
    }

    fn release_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        match state.readers.get_mut(&me) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.readers.remove(&me);
                self.cond.notify_all();
            }
            None => warn!("ignoring read unlock by a thread that holds no read lock"),
        }
    }

    fn release_write(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        let released = match &mut state.writer {
            Some((owner, count)) if *owner == me => {
                *count -= 1;
                *count == 0
            }
            _ => {
                warn!("ignoring write unlock by a thread that holds no write lock");
                return;
            }
        };
        if released {
            state.writer = None;
            self.cond.notify_all();
        }
    }
}

/// Shared hold on an entity, released on drop. Tied to the acquiring thread.
pub(crate) struct ReadGuard {
    lock: Arc<EntityLock>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive hold on an entity, released on drop. Tied to the acquiring
/// thread.
pub(crate) struct WriteGuard {
    lock: Arc<EntityLock>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn reads_are_reentrant() {
        let locks = LockManager::new();
        let a = locks.read(1);
        let b = locks.read(1);
        drop(a);
        drop(b);
        // a writer can get in afterwards
        let _w = locks.write(1);
    }

    #[test]
    fn writes_are_reentrant() {
        let locks = LockManager::new();
        let a = locks.write(1);
        let b = locks.write(1);
        drop(b);
        drop(a);
        let _r = locks.read(1);
    }

    #[test]
    fn readers_share_an_entity() {
        let locks = Arc::new(LockManager::new());
        let (tx, rx) = mpsc::channel();
        let _mine = locks.read(9);
        let other = Arc::clone(&locks);
        let handle = thread::spawn(move || {
            let _theirs = other.read(9);
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2))
            .expect("second reader should not block");
        handle.join().unwrap();
    }

    #[test]
    fn writer_excludes_readers() {
        let locks = Arc::new(LockManager::new());
        let guard = locks.write(4);
        let (tx, rx) = mpsc::channel();
        let other = Arc::clone(&locks);
        let handle = thread::spawn(move || {
            let _r = other.read(4);
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(2))
            .expect("reader should run after the writer released");
        handle.join().unwrap();
    }

    #[test]
    fn queued_writer_blocks_later_readers() {
        let locks = Arc::new(LockManager::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_read = locks.read(7);

        let w_locks = Arc::clone(&locks);
        let w_order = order.clone();
        let writer = thread::spawn(move || {
            let _w = w_locks.write(7);
            w_order.lock().unwrap().push("write");
        });
        thread::sleep(Duration::from_millis(100));

        let r_locks = Arc::clone(&locks);
        let r_order = order.clone();
        let reader = thread::spawn(move || {
            let _r = r_locks.read(7);
            r_order.lock().unwrap().push("read");
        });
        thread::sleep(Duration::from_millis(100));

        drop(first_read);
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["write", "read"]);
    }

    #[test]
    fn sole_reader_upgrades_without_deadlock() {
        let locks = LockManager::new();
        let read = locks.read(2);
        let write = locks.write(2);
        drop(write);
        drop(read);
    }

    #[test]
    fn foreign_unlock_is_ignored() {
        let lock = EntityLock::default();
        // no lock held by this thread; both releases are no-ops
        lock.release_read();
        lock.release_write();
        lock.acquire_read();
        lock.release_read();
    }
}
