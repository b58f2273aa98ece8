//! Wire-id allocator and in-flight request table.
//!
//! Ids are claimed from an atomic counter and mapped to slots in 256-entry
//! rows keyed by `id >> 8`. Rows are reclaimed incrementally: freeing the
//! last slot of a row deletes the row, so a connection that keeps
//! completing requests holds O(1) rows no matter how many ids it has
//! burned through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::request::{Request, PING_REQUEST_ID};

const ROW_LOG: u32 = 8;
const ROW_N: u32 = 1 << ROW_LOG;
const ROW_MASK: u32 = ROW_N - 1;

#[derive(Default)]
struct Slot {
    claimed: bool,
    request: Option<Arc<Request>>,
}

struct RequestRow {
    freed: AtomicU32,
    slots: Vec<Mutex<Slot>>,
}

impl RequestRow {
    fn new() -> Arc<RequestRow> {
        Arc::new(RequestRow {
            freed: AtomicU32::new(0),
            slots: (0..ROW_N).map(|_| Mutex::new(Slot::default())).collect(),
        })
    }

    /// Rows containing a reserved id only ever see 255 live slots.
    fn capacity(key: u32) -> u32 {
        if key == 0 || key == PING_REQUEST_ID >> ROW_LOG {
            ROW_N - 1
        } else {
            ROW_N
        }
    }
}

/// Per-connection table mapping wire ids to in-flight requests.
pub struct RequestHolder {
    rows: RwLock<HashMap<u32, Arc<RequestRow>>>,
    count: AtomicU32,
    cur_id: AtomicU32,
}

impl RequestHolder {
    pub fn new() -> Self {
        RequestHolder {
            rows: RwLock::new(HashMap::new()),
            count: AtomicU32::new(0),
            cur_id: AtomicU32::new(0),
        }
    }

    /// Number of claimed slots.
    #[inline]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Number of live rows (exposed for reclamation checks).
    pub fn rows(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    fn row(&self, key: u32) -> Arc<RequestRow> {
        if let Some(row) = self.rows.read().unwrap().get(&key) {
            return row.clone();
        }
        let mut rows = self.rows.write().unwrap();
        rows.entry(key).or_insert_with(RequestRow::new).clone()
    }

    /// Claim the next free wire id. Ids 0 and the ping id are skipped.
    pub fn get_next(&self) -> u32 {
        loop {
            let id = self.cur_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if id == 0 || id == PING_REQUEST_ID {
                continue;
            }
            let row = self.row(id >> ROW_LOG);
            let mut slot = row.slots[(id & ROW_MASK) as usize].lock().unwrap();
            if slot.claimed {
                continue;
            }
            slot.claimed = true;
            self.count.fetch_add(1, Ordering::AcqRel);
            return id;
        }
    }

    /// Attach the request to a previously claimed id.
    pub fn bind(&self, id: u32, req: Arc<Request>) {
        let row = self.row(id >> ROW_LOG);
        let mut slot = row.slots[(id & ROW_MASK) as usize].lock().unwrap();
        debug_assert!(slot.claimed);
        slot.request = Some(req);
    }

    /// Drop the request reference but keep the id claimed (the wire still
    /// owes a response for it).
    pub fn clear(&self, id: u32) {
        if let Some(row) = self.rows.read().unwrap().get(&(id >> ROW_LOG)) {
            row.slots[(id & ROW_MASK) as usize].lock().unwrap().request = None;
        }
    }

    /// Free the slot and return its request, reclaiming the row when its
    /// last slot goes.
    pub fn remove(&self, id: u32) -> Option<Arc<Request>> {
        let key = id >> ROW_LOG;
        let row = self.rows.read().unwrap().get(&key)?.clone();
        let req = {
            let mut slot = row.slots[(id & ROW_MASK) as usize].lock().unwrap();
            if !slot.claimed {
                return None;
            }
            slot.claimed = false;
            slot.request.take()
        };
        self.count.fetch_sub(1, Ordering::AcqRel);
        let freed = row.freed.fetch_add(1, Ordering::AcqRel) + 1;
        if freed == RequestRow::capacity(key) {
            self.rows.write().unwrap().remove(&key);
        }
        req
    }

    /// Take every in-flight request and reset the table. Used when the
    /// connection closes and the remainder must be flushed.
    pub fn drain(&self) -> Vec<Arc<Request>> {
        let rows = {
            let mut rows = self.rows.write().unwrap();
            self.count.store(0, Ordering::Release);
            std::mem::take(&mut *rows)
        };
        let mut reqs = Vec::new();
        for row in rows.values() {
            for slot in &row.slots {
                let mut slot = slot.lock().unwrap();
                if let Some(req) = slot.request.take() {
                    reqs.push(req);
                }
                slot.claimed = false;
            }
        }
        reqs
    }
}

impl Default for RequestHolder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{Callback, Response};
    use bytes::Bytes;

    fn dummy(id: u32) -> Arc<Request> {
        Request::new(1, id, Bytes::new(), Callback(|_res: Response| {}))
    }

    #[test]
    fn test_skips_zero_and_ping_id() {
        let holder = RequestHolder::new();
        let first = holder.get_next();
        assert_eq!(first, 1);

        let holder = RequestHolder::new();
        holder.cur_id.store(PING_REQUEST_ID - 1, Ordering::Release);
        let id = holder.get_next();
        assert_ne!(id, PING_REQUEST_ID);
        assert_ne!(id, 0);
        assert_eq!(id, 1);
    }

    #[test]
    fn test_bind_remove_roundtrip() {
        let holder = RequestHolder::new();
        let id = holder.get_next();
        let req = dummy(id);
        holder.bind(id, req.clone());
        assert_eq!(holder.count(), 1);

        let got = holder.remove(id).unwrap();
        assert!(Arc::ptr_eq(&got, &req));
        assert_eq!(holder.count(), 0);
        assert!(holder.remove(id).is_none());
    }

    #[test]
    fn test_clear_keeps_slot_claimed() {
        let holder = RequestHolder::new();
        let id = holder.get_next();
        holder.bind(id, dummy(id));
        holder.clear(id);
        assert_eq!(holder.count(), 1);
        assert!(holder.remove(id).is_none());
        assert_eq!(holder.count(), 0);
    }

    #[test]
    fn test_row_reclamation_sequential() {
        let holder = RequestHolder::new();
        for _ in 0..10_000 {
            let id = holder.get_next();
            holder.bind(id, dummy(id));
            holder.remove(id).unwrap();
        }
        assert_eq!(holder.count(), 0);
        // Only the row containing the most recent ids may remain.
        assert!(
            holder.rows() <= 2,
            "expected O(1) rows, got {}",
            holder.rows()
        );
    }

    #[test]
    fn test_drain_returns_all_inflight() {
        let holder = RequestHolder::new();
        let mut bound = Vec::new();
        for _ in 0..300 {
            let id = holder.get_next();
            let req = dummy(id);
            holder.bind(id, req.clone());
            bound.push(req);
        }
        let drained = holder.drain();
        assert_eq!(drained.len(), 300);
        assert_eq!(holder.count(), 0);
        assert_eq!(holder.rows(), 0);
    }

    #[test]
    fn test_claimed_slot_not_reissued_on_wrap() {
        let holder = RequestHolder::new();
        let first = holder.get_next();
        holder.bind(first, dummy(first));
        // Wind the counter back so the allocator revisits the same slot.
        holder.cur_id.store(first - 1, Ordering::Release);
        let second = holder.get_next();
        assert_ne!(second, first);
    }
}
