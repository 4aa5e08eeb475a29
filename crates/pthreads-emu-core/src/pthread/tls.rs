//! POSIX thread-specific data (TSD) keys.
//!
//! ## Design
//!
//! - **Key registry**: a fixed array of `PTHREAD_KEYS_MAX` slots behind a
//!   reader-writer lock. Each slot tracks in-use state, the optional
//!   destructor and a sequence number bumped on create and delete, so a
//!   deleted key is never mistaken for its slot's next occupant.
//!
//! - **Per-thread values**: a thread-local table indexed by key id. Entries
//!   remember the sequence they were written under; values stored under a
//!   deleted key read back as 0.
//!
//! - **Destructors**: run once per key at thread exit, for non-zero values
//!   whose key is still live. Values set by a destructor are discarded, not
//!   revisited. Each slot has a destructor gate; `key_delete` passes through
//!   it, so it returns only after any destructor already running for that
//!   key has finished.

use std::cell::RefCell;

use libc::c_int;
use parking_lot::RwLock;

use crate::error::{Error, Result, to_errno};
use crate::kernel::{CriticalSection, critical_section};
use crate::trace::{self, LogLevel};

/// Maximum number of TSD keys.
pub const PTHREAD_KEYS_MAX: usize = 1024;

/// Destructor passes run at thread exit.
pub const PTHREAD_DESTRUCTOR_ITERATIONS: usize = 1;

/// Thread-specific data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PthreadKey {
    /// Index into the global registry.
    pub(crate) id: u32,
    /// Registry sequence at creation; 0 never names a live key.
    pub(crate) seq: u32,
}

// ---------------------------------------------------------------------------
// Global key registry
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct KeySlot {
    in_use: bool,
    destructor: Option<fn(usize)>,
    seq: u32,
}

const EMPTY_SLOT: KeySlot = KeySlot {
    in_use: false,
    destructor: None,
    seq: 0,
};

struct KeyRegistry {
    slots: [KeySlot; PTHREAD_KEYS_MAX],
}

impl KeyRegistry {
    fn live(&self, key: PthreadKey) -> Option<&KeySlot> {
        self.slots
            .get(key.id as usize)
            .filter(|slot| slot.in_use && slot.seq == key.seq)
    }
}

static KEY_REGISTRY: RwLock<KeyRegistry> = parking_lot::const_rwlock(KeyRegistry {
    slots: [EMPTY_SLOT; PTHREAD_KEYS_MAX],
});

static DESTRUCTOR_GATES: [CriticalSection<()>; PTHREAD_KEYS_MAX] =
    [const { critical_section(()) }; PTHREAD_KEYS_MAX];

// ---------------------------------------------------------------------------
// Per-thread value storage
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Entry {
    seq: u32,
    value: usize,
}

/// Values of one thread. Dropping it (host thread end) runs destructors for
/// threads that never went through the spawn trampoline.
struct ValueTable(RefCell<Vec<Option<Entry>>>);

impl Drop for ValueTable {
    fn drop(&mut self) {
        run_table(std::mem::take(self.0.get_mut()));
    }
}

thread_local! {
    static VALUES: ValueTable = const { ValueTable(RefCell::new(Vec::new())) };
}

// ---------------------------------------------------------------------------
// Key lifecycle
// ---------------------------------------------------------------------------

/// Allocate a key. `EAGAIN` when all `PTHREAD_KEYS_MAX` are in use.
pub fn key_create(destructor: Option<fn(usize)>) -> Result<PthreadKey> {
    let mut registry = KEY_REGISTRY.write();
    let (id, slot) = registry
        .slots
        .iter_mut()
        .enumerate()
        .find(|(_, slot)| !slot.in_use)
        .ok_or(Error::Again)?;
    slot.in_use = true;
    slot.destructor = destructor;
    slot.seq = next_seq(slot.seq);
    let key = PthreadKey {
        id: id as u32,
        seq: slot.seq,
    };
    drop(registry);
    trace::event(LogLevel::Trace, "key_create", |r| {
        r.with_object("key")
            .with_details(serde_json::json!({ "id": key.id }))
    });
    Ok(key)
}

const fn next_seq(seq: u32) -> u32 {
    match seq.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}

/// Release a key. Destructors are not run; values stay in threads but
/// become unreachable. Waits out a destructor already running for `key`.
pub fn key_delete(key: PthreadKey) -> Result<()> {
    {
        let mut registry = KEY_REGISTRY.write();
        if registry.live(key).is_none() {
            return Err(Error::Invalid);
        }
        let slot = &mut registry.slots[key.id as usize];
        slot.in_use = false;
        slot.destructor = None;
        slot.seq = next_seq(slot.seq);
    }
    drop(DESTRUCTOR_GATES[key.id as usize].lock());
    trace::event(LogLevel::Trace, "key_delete", |r| {
        r.with_object("key")
            .with_details(serde_json::json!({ "id": key.id }))
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Calling thread's value for `key`; 0 if unset or the key is not live.
#[must_use]
pub fn get_specific(key: PthreadKey) -> usize {
    let stored = VALUES
        .try_with(|table| table.0.borrow().get(key.id as usize).copied().flatten())
        .ok()
        .flatten();
    match stored {
        Some(entry) if entry.seq == key.seq => entry.value,
        _ => 0,
    }
}

/// Set the calling thread's value for `key`. `EINVAL` for a dead key.
pub fn set_specific(key: PthreadKey, value: usize) -> Result<()> {
    if KEY_REGISTRY.read().live(key).is_none() {
        return Err(Error::Invalid);
    }
    let index = key.id as usize;
    VALUES
        .try_with(|table| {
            let mut values = table.0.borrow_mut();
            if values.len() <= index {
                values.resize(index + 1, None);
            }
            values[index] = Some(Entry {
                seq: key.seq,
                value,
            });
        })
        .map_err(|_| Error::Invalid)
}

/// Run the calling thread's destructors and clear its values.
pub(crate) fn run_destructors() -> usize {
    let values = VALUES
        .try_with(|table| std::mem::take(&mut *table.0.borrow_mut()))
        .unwrap_or_default();
    let ran = run_table(values);
    let _ = VALUES.try_with(|table| table.0.borrow_mut().clear());
    if ran > 0 {
        trace::event(LogLevel::Debug, "tsd_destructors_run", |r| {
            r.with_details(serde_json::json!({ "ran": ran }))
        });
    }
    ran
}

fn run_table(values: Vec<Option<Entry>>) -> usize {
    let mut ran = 0;
    for (index, entry) in values.into_iter().enumerate() {
        let Some(entry) = entry.filter(|entry| entry.value != 0) else {
            continue;
        };
        let _gate = DESTRUCTOR_GATES[index].lock();
        let destructor = KEY_REGISTRY
            .read()
            .slots
            .get(index)
            .filter(|slot| slot.in_use && slot.seq == entry.seq)
            .and_then(|slot| slot.destructor);
        if let Some(destructor) = destructor {
            destructor(entry.value);
            ran += 1;
        }
    }
    ran
}

// ---------------------------------------------------------------------------
// POSIX surface
// ---------------------------------------------------------------------------

pub fn pthread_key_create(key: &mut PthreadKey, destructor: Option<fn(usize)>) -> c_int {
    match key_create(destructor) {
        Ok(created) => {
            *key = created;
            0
        }
        Err(err) => err.errno(),
    }
}

pub fn pthread_key_delete(key: PthreadKey) -> c_int {
    to_errno(key_delete(key))
}

pub fn pthread_getspecific(key: PthreadKey) -> usize {
    get_specific(key)
}

pub fn pthread_setspecific(key: PthreadKey, value: usize) -> c_int {
    to_errno(set_specific(key, value))
}
