// Object arena - single-threaded storage for all collectable objects
//
// Key design principles:
// 1. GcRef is a u32 index into Vec storage - values stay 16 bytes
// 2. Vec<Option<GcObject>> with a free list for O(1) alloc/free
// 3. GC header embedded in every slot; ownership-list links live in the
//    header, so intrusive list surgery is plain index chasing
// 4. No Rc/RefCell overhead - access goes through &/&mut ObjectPool

use smol_str::SmolStr;

use super::header::{GcHeader, GcRef, ObjectKind};
use crate::loam_value::{
    LoamClosure, LoamProto, LoamTable, LoamThread, LoamUserdata, NativeClosure,
};

/// Short string payload: hash-consed, chained through `hnext` into its
/// string-table slot. The hash is final, computed at intern time.
pub struct ShortStr {
    pub(crate) data: SmolStr,
    pub(crate) hash: u32,
    pub(crate) hnext: Option<GcRef>,
}

/// Long string payload: allocated individually, never interned. The hash
/// starts as the table seed and is folded in lazily on first request;
/// `has_hash` records that it happened.
pub struct LongStr {
    pub(crate) data: Box<str>,
    pub(crate) hash: u32,
    pub(crate) has_hash: bool,
}

/// Payload of a collectable object - the eight collectable kinds.
pub enum GcBody {
    ShortStr(ShortStr),
    LongStr(LongStr),
    Table(Box<LoamTable>),
    Userdata(Box<LoamUserdata>),
    Closure(Box<LoamClosure>),
    NativeClosure(Box<NativeClosure>),
    Proto(Box<LoamProto>),
    Thread(Box<LoamThread>),
}

impl GcBody {
    #[inline(always)]
    pub fn kind(&self) -> ObjectKind {
        match self {
            GcBody::ShortStr(_) => ObjectKind::ShortStr,
            GcBody::LongStr(_) => ObjectKind::LongStr,
            GcBody::Table(_) => ObjectKind::Table,
            GcBody::Userdata(_) => ObjectKind::Userdata,
            GcBody::Closure(_) => ObjectKind::Closure,
            GcBody::NativeClosure(_) => ObjectKind::NativeClosure,
            GcBody::Proto(_) => ObjectKind::Proto,
            GcBody::Thread(_) => ObjectKind::Thread,
        }
    }
}

pub struct GcObject {
    pub header: GcHeader,
    pub body: GcBody,
}

/// Arena storage for every collectable object in one VM.
pub struct ObjectPool {
    slots: Vec<Option<GcObject>>,
    free_list: Vec<u32>,
    count: usize,
}

impl ObjectPool {
    pub fn new() -> Self {
        ObjectPool {
            slots: Vec::with_capacity(128),
            free_list: Vec::new(),
            count: 0,
        }
    }

    /// Store an object and return its reference.
    pub fn insert(&mut self, obj: GcObject) -> GcRef {
        self.count += 1;
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(obj);
            GcRef(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(obj));
            GcRef(idx)
        }
    }

    /// Remove an object, returning it so the caller can unwind payload
    /// state (string-table unchaining, upvalue closing) before drop.
    pub fn remove(&mut self, r: GcRef) -> Option<GcObject> {
        let slot = self.slots.get_mut(r.index())?;
        let obj = slot.take()?;
        self.free_list.push(r.0);
        self.count -= 1;
        Some(obj)
    }

    #[inline(always)]
    pub fn get(&self, r: GcRef) -> Option<&GcObject> {
        self.slots.get(r.index()).and_then(|s| s.as_ref())
    }

    #[inline(always)]
    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut GcObject> {
        self.slots.get_mut(r.index()).and_then(|s| s.as_mut())
    }

    #[inline(always)]
    pub fn contains(&self, r: GcRef) -> bool {
        self.get(r).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    // ==================== Header shortcuts ====================

    #[inline(always)]
    pub fn header(&self, r: GcRef) -> Option<&GcHeader> {
        self.get(r).map(|o| &o.header)
    }

    #[inline(always)]
    pub fn header_mut(&mut self, r: GcRef) -> Option<&mut GcHeader> {
        self.get_mut(r).map(|o| &mut o.header)
    }

    #[inline(always)]
    pub fn kind(&self, r: GcRef) -> Option<ObjectKind> {
        self.header(r).map(|h| h.kind)
    }

    #[inline(always)]
    pub fn is_white(&self, r: GcRef) -> bool {
        self.header(r).map(|h| h.is_white()).unwrap_or(false)
    }

    #[inline(always)]
    pub fn is_black(&self, r: GcRef) -> bool {
        self.header(r).map(|h| h.is_black()).unwrap_or(false)
    }

    #[inline(always)]
    pub fn next_of(&self, r: GcRef) -> Option<GcRef> {
        self.header(r).and_then(|h| h.next)
    }

    // ==================== Typed accessors ====================

    pub fn table(&self, r: GcRef) -> Option<&LoamTable> {
        match self.get(r) {
            Some(GcObject {
                body: GcBody::Table(t),
                ..
            }) => Some(t),
            _ => None,
        }
    }

    pub fn table_mut(&mut self, r: GcRef) -> Option<&mut LoamTable> {
        match self.get_mut(r) {
            Some(GcObject {
                body: GcBody::Table(t),
                ..
            }) => Some(t),
            _ => None,
        }
    }

    pub fn thread(&self, r: GcRef) -> Option<&LoamThread> {
        match self.get(r) {
            Some(GcObject {
                body: GcBody::Thread(t),
                ..
            }) => Some(t),
            _ => None,
        }
    }

    pub fn thread_mut(&mut self, r: GcRef) -> Option<&mut LoamThread> {
        match self.get_mut(r) {
            Some(GcObject {
                body: GcBody::Thread(t),
                ..
            }) => Some(t),
            _ => None,
        }
    }

    pub fn userdata(&self, r: GcRef) -> Option<&LoamUserdata> {
        match self.get(r) {
            Some(GcObject {
                body: GcBody::Userdata(u),
                ..
            }) => Some(u),
            _ => None,
        }
    }

    pub fn userdata_mut(&mut self, r: GcRef) -> Option<&mut LoamUserdata> {
        match self.get_mut(r) {
            Some(GcObject {
                body: GcBody::Userdata(u),
                ..
            }) => Some(u),
            _ => None,
        }
    }

    pub fn closure(&self, r: GcRef) -> Option<&LoamClosure> {
        match self.get(r) {
            Some(GcObject {
                body: GcBody::Closure(c),
                ..
            }) => Some(c),
            _ => None,
        }
    }

    pub fn native_closure(&self, r: GcRef) -> Option<&NativeClosure> {
        match self.get(r) {
            Some(GcObject {
                body: GcBody::NativeClosure(c),
                ..
            }) => Some(c),
            _ => None,
        }
    }

    pub fn proto(&self, r: GcRef) -> Option<&LoamProto> {
        match self.get(r) {
            Some(GcObject {
                body: GcBody::Proto(p),
                ..
            }) => Some(p),
            _ => None,
        }
    }

    pub fn proto_mut(&mut self, r: GcRef) -> Option<&mut LoamProto> {
        match self.get_mut(r) {
            Some(GcObject {
                body: GcBody::Proto(p),
                ..
            }) => Some(p),
            _ => None,
        }
    }

    /// String content for either string kind.
    pub fn str_data(&self, r: GcRef) -> Option<&str> {
        match self.get(r) {
            Some(GcObject {
                body: GcBody::ShortStr(s),
                ..
            }) => Some(s.data.as_str()),
            Some(GcObject {
                body: GcBody::LongStr(s),
                ..
            }) => Some(&s.data),
            _ => None,
        }
    }

    pub(crate) fn short_str(&self, r: GcRef) -> Option<&ShortStr> {
        match self.get(r) {
            Some(GcObject {
                body: GcBody::ShortStr(s),
                ..
            }) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn short_str_mut(&mut self, r: GcRef) -> Option<&mut ShortStr> {
        match self.get_mut(r) {
            Some(GcObject {
                body: GcBody::ShortStr(s),
                ..
            }) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn long_str_mut(&mut self, r: GcRef) -> Option<&mut LongStr> {
        match self.get_mut(r) {
            Some(GcObject {
                body: GcBody::LongStr(s),
                ..
            }) => Some(s),
            _ => None,
        }
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}
