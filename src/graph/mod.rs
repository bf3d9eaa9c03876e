//! Offline reconstruction of sampled heap graphs.
//!
//! The analysis side of the profiler: given the interned types, objects,
//! references, and roots recorded for one process snapshot, the tracker in
//! [`tracker`] materializes a reachability graph, computes root distances,
//! resolves superclass chains, and [`flamegraph`] folds retention into a
//! flamegraph tree. One tracker instance processes one trace,
//! single-threaded; interleaved writer streams are kept apart by keying all
//! interning state on a sequence id.

pub mod flamegraph;
pub mod normalize;
pub mod tracker;

pub use self::flamegraph::FlamegraphRow;
pub use self::tracker::HeapGraphTracker;

use std::collections::HashMap;
use std::str::FromStr;

/// Index into the tracker's interned string table.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StringId(pub u32);

/// Row index in the object table.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectId(pub u32);

/// Row index in the class table.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClassId(pub u32);

/// Append-only string interner; ids are dense and stable.
#[derive(Default)]
pub struct StringInterner {
    strings: Vec<String>,
    ids: HashMap<String, StringId>,
}

impl StringInterner {
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = StringId(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        id
    }

    /// Lookup without inserting.
    pub fn find(&self, s: &str) -> Option<StringId> {
        self.ids.get(s).cloned()
    }

    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.0 as usize]
    }
}

/// How an object is pinned by the runtime. Arrives as a string tag on root
/// frames; anything unrecognized maps to `Unknown`.
#[derive(Clone, Copy, Debug, EnumString, Eq, Hash, PartialEq)]
pub enum RootType {
    #[strum(serialize = "global")]
    Global,
    #[strum(serialize = "jni_global")]
    JniGlobal,
    #[strum(serialize = "jni_local")]
    JniLocal,
    #[strum(serialize = "java_frame")]
    JavaFrame,
    #[strum(serialize = "native_stack")]
    NativeStack,
    #[strum(serialize = "sticky_class")]
    StickyClass,
    #[strum(serialize = "thread_block")]
    ThreadBlock,
    #[strum(serialize = "monitor_used")]
    MonitorUsed,
    #[strum(serialize = "thread_object")]
    ThreadObject,
    #[strum(serialize = "interned_string")]
    InternedString,
    #[strum(serialize = "finalizing")]
    Finalizing,
    #[strum(serialize = "debugger")]
    Debugger,
    #[strum(serialize = "vm_internal")]
    VmInternal,
    #[strum(serialize = "jni_monitor")]
    JniMonitor,
    #[strum(serialize = "unknown")]
    Unknown,
}

impl RootType {
    pub fn from_tag(tag: &str) -> RootType {
        RootType::from_str(tag).unwrap_or(RootType::Unknown)
    }
}

/// One object row. Created on first reference by id; the sizes and type are
/// filled in when the object's own frame arrives.
#[derive(Clone, Debug)]
pub struct ObjectRow {
    pub upid: u32,
    pub graph_sample_ts: i64,
    pub self_size: u64,
    pub type_id: Option<ClassId>,
    /// Index of this object's first row in the reference table; all of its
    /// rows are contiguous from there. `None` for leaf objects.
    pub reference_set_id: Option<u32>,
    pub reachable: bool,
    pub root_type: Option<RootType>,
    /// Shortest edge count from any root; -1 until a root reaches it.
    pub root_distance: i64,
}

/// One outbound edge. Rows sharing a `reference_set_id` belong to the same
/// owner and sit contiguously in insertion order; distance search and
/// flamegraph building both lean on that.
#[derive(Clone, Debug)]
pub struct ReferenceRow {
    pub reference_set_id: u32,
    pub owner_id: ObjectId,
    pub owned_id: ObjectId,
    pub field_name: Option<StringId>,
    pub field_type_name: Option<StringId>,
}

/// One class row. Created as a placeholder on first use by an object frame,
/// named and located at finalization.
#[derive(Clone, Debug)]
pub struct ClassRow {
    pub name: StringId,
    pub location: Option<StringId>,
    pub superclass_id: Option<ClassId>,
    pub deobfuscated_name: Option<StringId>,
    /// Package attributed from the location path, when recognizable.
    pub package: Option<StringId>,
}

/// Ingest anomaly counters; the tracker drops or degrades instead of
/// failing, and these record what it had to do.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub dropped_packets: u64,
    pub upid_ts_mismatch: u64,
    pub unknown_location_iid: u64,
    /// Root object ids that never resolved to an object. Counted silently;
    /// the broken frame was already reported when it was dropped.
    pub roots_unresolved: u64,
}

/// An object frame as it appears on the wire, before id translation.
#[derive(Clone, Debug)]
pub struct SourceObject {
    pub object_id: u64,
    pub type_iid: u64,
    pub self_size: u64,
    pub references: Vec<SourceReference>,
}

#[derive(Clone, Debug)]
pub struct SourceReference {
    pub field_name_iid: Option<u64>,
    /// 0 encodes a null reference.
    pub owned_object_id: u64,
}

/// A root frame: a set of wire object ids pinned for one reason.
#[derive(Clone, Debug)]
pub struct SourceRoot {
    pub root_type: RootType,
    pub object_ids: Vec<u64>,
}
