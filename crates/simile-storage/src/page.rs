//! Slotted heap page.
//!
//! Page layout on disk:
//! ```text
//! +--------------------------+
//! | total slots    : u32 LE  |
//! | free slots     : u32 LE  |
//! +--------------------------+
//! | occupied rows, packed    |
//! | back-to-back in slot     |
//! | order                    |
//! +--------------------------+
//! | zero padding to PAGE_SIZE|
//! +--------------------------+
//! ```
//!
//! Only the occupied rows are written; a reader reconstructs slot numbers
//! from their position in the packed stream. After a flush and reload a
//! row's slot number may therefore change — record identities are only
//! stable within the life of a cached page.

use crate::tuple::{RecordId, Tuple, TupleDesc};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use simile_buffer::Page;
use simile_common::{PageKey, Result, SimileError, PAGE_SIZE};
use std::any::Any;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Slots {
    records: Vec<Option<Tuple>>,
    open_slots: usize,
}

/// A page of fixed-width rows belonging to one heap file.
///
/// Pages are shared via `Arc` by the buffer pool; the lock protocol
/// serializes mutation, and the internal mutex keeps individual operations
/// atomic with respect to concurrent readers of other transactions.
pub struct HeapPage {
    file_name: String,
    page_no: usize,
    desc: TupleDesc,
    dim: usize,
    total_slots: usize,
    slots: Mutex<Slots>,
    dirty: AtomicBool,
}

impl HeapPage {
    /// Creates an empty page for the given descriptor.
    pub fn new(desc: TupleDesc, dim: usize, page_no: usize, file_name: impl Into<String>) -> Result<Self> {
        let total_slots = desc.slots_per_page(dim)?;
        Ok(Self {
            file_name: file_name.into(),
            page_no,
            desc,
            dim,
            total_slots,
            slots: Mutex::new(Slots {
                records: vec![None; total_slots],
                open_slots: total_slots,
            }),
            dirty: AtomicBool::new(false),
        })
    }

    /// Reconstructs a page from its on-disk bytes.
    pub fn from_bytes(
        mut buf: &[u8],
        desc: &TupleDesc,
        dim: usize,
        page_no: usize,
        file_name: impl Into<String>,
    ) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(SimileError::MalformedData(
                "page shorter than its header".to_string(),
            ));
        }
        let file_name = file_name.into();
        let total_slots = buf.get_u32_le() as usize;
        let open_slots = buf.get_u32_le() as usize;
        if open_slots > total_slots {
            return Err(SimileError::MalformedData(format!(
                "page header claims {open_slots} free of {total_slots} slots"
            )));
        }

        let mut records = vec![None; total_slots];
        for slot_no in 0..total_slots - open_slots {
            let mut t = Tuple::read_from(&mut buf, desc, dim)?;
            t.rid = Some(RecordId::Heap {
                file: file_name.clone(),
                page_no,
                slot_no,
            });
            records[slot_no] = Some(t);
        }

        Ok(Self {
            file_name,
            page_no,
            desc: desc.clone(),
            dim,
            total_slots,
            slots: Mutex::new(Slots {
                records,
                open_slots,
            }),
            dirty: AtomicBool::new(false),
        })
    }

    /// Serializes the page: header, occupied rows packed, zero padding.
    pub fn to_bytes(&self) -> Result<BytesMut> {
        let slots = self.slots.lock();
        let mut buf = BytesMut::with_capacity(PAGE_SIZE);
        buf.put_u32_le(self.total_slots as u32);
        buf.put_u32_le(slots.open_slots as u32);
        for record in slots.records.iter().flatten() {
            record.write_to(&mut buf, self.dim)?;
        }
        buf.resize(PAGE_SIZE, 0);
        Ok(buf)
    }

    /// The page number within the owning file.
    pub fn page_no(&self) -> usize {
        self.page_no
    }

    /// Total number of row slots on this page.
    pub fn total_slots(&self) -> usize {
        self.total_slots
    }

    /// Stores the row in the lowest unused slot and returns its identity.
    pub fn insert_tuple(&self, t: &Tuple) -> Result<RecordId> {
        let mut slots = self.slots.lock();
        if slots.open_slots == 0 {
            return Err(SimileError::PageFull);
        }
        let slot_no = slots
            .records
            .iter()
            .position(|r| r.is_none())
            .ok_or(SimileError::PageFull)?;
        let rid = RecordId::Heap {
            file: self.file_name.clone(),
            page_no: self.page_no,
            slot_no,
        };
        let mut stored = t.clone();
        stored.rid = Some(rid.clone());
        slots.records[slot_no] = Some(stored);
        slots.open_slots -= 1;
        drop(slots);
        self.set_dirty(true);
        Ok(rid)
    }

    fn check_rid(&self, rid: &RecordId) -> Result<usize> {
        let RecordId::Heap {
            file,
            page_no,
            slot_no,
        } = rid;
        if file != &self.file_name || *page_no != self.page_no {
            return Err(SimileError::IllegalOperation(format!(
                "record {file}:{page_no}:{slot_no} does not belong to page {}:{}",
                self.file_name, self.page_no
            )));
        }
        if *slot_no >= self.total_slots {
            return Err(SimileError::IllegalOperation(format!(
                "slot {slot_no} out of range for page with {} slots",
                self.total_slots
            )));
        }
        Ok(*slot_no)
    }

    /// Clears the slot named by `rid`.
    pub fn delete_tuple(&self, rid: &RecordId) -> Result<()> {
        let slot_no = self.check_rid(rid)?;
        let mut slots = self.slots.lock();
        if slots.records[slot_no].is_none() {
            return Err(SimileError::TupleNotFound(format!(
                "no tuple in slot {slot_no}"
            )));
        }
        slots.records[slot_no] = None;
        slots.open_slots += 1;
        drop(slots);
        self.set_dirty(true);
        Ok(())
    }

    /// Returns the row stored in the slot named by `rid`.
    pub fn find_tuple(&self, rid: &RecordId) -> Result<Tuple> {
        let slot_no = self.check_rid(rid)?;
        let slots = self.slots.lock();
        slots.records[slot_no]
            .clone()
            .ok_or_else(|| SimileError::TupleNotFound(format!("no tuple in slot {slot_no}")))
    }

    /// Snapshot of the occupied rows in slot order, each carrying its
    /// record identity.
    pub fn tuples(&self) -> Vec<Tuple> {
        let slots = self.slots.lock();
        slots.records.iter().flatten().cloned().collect()
    }
}

impl Page for HeapPage {
    fn key(&self) -> PageKey {
        PageKey::new(self.file_name.clone(), self.page_no)
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    fn open_slots(&self) -> usize {
        self.slots.lock().open_slots
    }

    fn flush(&self) -> Result<()> {
        let bytes = self.to_bytes()?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.file_name)?;
        file.seek(SeekFrom::Start((self.page_no * PAGE_SIZE) as u64))?;
        file.write_all(&bytes)?;
        self.set_dirty(false);
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
