//! Streaming ingest and finalization of heap-graph frames.
//!
//! Frames arrive interleaved from multiple writer sequences; everything
//! mutable during streaming (interning tables, wire-id translation, buffered
//! roots, packet accounting) is keyed by sequence id and thrown away at
//! `finalize_profile`. The durable output is the object/reference/class
//! tables plus the per-snapshot root sets.

use std::collections::{HashMap, VecDeque};
use std::mem;

use graph::normalize;
use graph::{
    ClassId, ClassRow, ObjectId, ObjectRow, ReferenceRow, RootType, SourceObject, SourceRoot,
    Stats, StringId, StringInterner,
};

const SUPERCLASS_FIELD: &str = "java.lang.Class.superClass";

#[derive(Clone, Copy)]
struct InternedType {
    name: StringId,
    location_iid: Option<u64>,
}

#[derive(Clone, Copy)]
struct InternedField {
    field_name: StringId,
    field_type_name: Option<StringId>,
}

#[derive(Default)]
struct SequenceState {
    /// The single (upid, ts) this sequence is allowed to describe.
    current: Option<(u32, i64)>,
    packet_index: Option<u64>,
    interned_location_names: HashMap<u64, StringId>,
    interned_types: HashMap<u64, InternedType>,
    interned_field_names: HashMap<u64, InternedField>,
    wire_object_ids: HashMap<u64, ObjectId>,
    /// Class rows created on first use by an object frame; named at
    /// finalization.
    type_classes: HashMap<u64, ClassId>,
    pending_roots: Vec<SourceRoot>,
}

#[derive(Default)]
pub struct HeapGraphTracker {
    strings: StringInterner,
    objects: Vec<ObjectRow>,
    references: Vec<ReferenceRow>,
    classes: Vec<ClassRow>,
    roots: HashMap<(u32, i64), Vec<ObjectId>>,
    sequences: HashMap<u64, SequenceState>,
    deobfuscation: HashMap<(Option<String>, String), String>,
    stats: Stats,
}

fn upsert_object(
    objects: &mut Vec<ObjectRow>,
    wire_object_ids: &mut HashMap<u64, ObjectId>,
    wire_id: u64,
    upid: u32,
    ts: i64,
) -> ObjectId {
    if let Some(&id) = wire_object_ids.get(&wire_id) {
        return id;
    }
    let id = ObjectId(objects.len() as u32);
    objects.push(ObjectRow {
        upid,
        graph_sample_ts: ts,
        self_size: 0,
        type_id: None,
        reference_set_id: None,
        reachable: false,
        root_type: None,
        root_distance: -1,
    });
    wire_object_ids.insert(wire_id, id);
    id
}

fn get_or_create_class(
    classes: &mut Vec<ClassRow>,
    strings: &mut StringInterner,
    type_classes: &mut HashMap<u64, ClassId>,
    type_iid: u64,
) -> ClassId {
    if let Some(&id) = type_classes.get(&type_iid) {
        return id;
    }
    let id = ClassId(classes.len() as u32);
    // placeholder until finalization fills the name in
    let name = strings.intern("");
    classes.push(ClassRow {
        name,
        location: None,
        superclass_id: None,
        deobfuscated_name: None,
        package: None,
    });
    type_classes.insert(type_iid, id);
    id
}

/// Extracts the package a class location path belongs to, when the path is
/// one we know how to read.
pub fn package_from_location(location: &str) -> Option<String> {
    const MAIN_PREFIX: &str = "/data/app/";
    // (prefix of the install path, package it belongs to)
    const WELL_KNOWN: &[(&str, &str)] = &[
        ("/system_ext/priv-app/SystemUIGoogle/", "com.android.systemui"),
        ("/product/priv-app/Phonesky/", "com.android.vending"),
        ("/product/app/Maps/", "com.google.android.apps.maps"),
        (
            "/system_ext/priv-app/NexusLauncherRelease/",
            "com.google.android.apps.nexuslauncher",
        ),
        ("/product/app/Photos/", "com.google.android.apps.photos"),
        (
            "/product/priv-app/WellbeingPrebuilt/",
            "com.google.android.apps.wellbeing",
        ),
        ("/product/app/PrebuiltGmail/", "com.google.android.gm"),
        ("/product/priv-app/PrebuiltGmsCore", "com.google.android.gms"),
        (
            "/product/priv-app/Velvet/",
            "com.google.android.googlequicksearchbox",
        ),
        (
            "/product/app/LatinIMEGooglePrebuilt/",
            "com.google.android.inputmethod.latin",
        ),
    ];

    if location.starts_with(MAIN_PREFIX) {
        // /data/app/<package>-<suffix>/base.apk
        let segment = location[MAIN_PREFIX.len()..].split('/').next().unwrap_or("");
        let package = segment.split('-').next().unwrap_or("");
        if package.is_empty() {
            return None;
        }
        return Some(package.to_string());
    }

    if location.contains("MatchMaker") {
        return Some("com.google.android.gms".to_string());
    }

    for &(prefix, package) in WELL_KNOWN {
        if location.starts_with(prefix) {
            return Some(package.to_string());
        }
    }

    // A bare "base.apk" location carries no directory to attribute; treat it
    // like every other unknown path.
    None
}

impl HeapGraphTracker {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn objects(&self) -> &[ObjectRow] {
        &self.objects
    }

    pub fn references(&self) -> &[ReferenceRow] {
        &self.references
    }

    pub fn classes(&self) -> &[ClassRow] {
        &self.classes
    }

    pub fn string(&self, id: StringId) -> &str {
        self.strings.get(id)
    }

    pub(crate) fn roots_for(&self, upid: u32, ts: i64) -> Option<&[ObjectId]> {
        self.roots.get(&(upid, ts)).map(|roots| roots.as_slice())
    }

    /// The name a class should display under: deobfuscated when a mapping
    /// matched, the recorded name otherwise.
    pub fn class_display_name(&self, class: Option<ClassId>) -> &str {
        match class {
            Some(id) => {
                let row = &self.classes[id.0 as usize];
                self.strings.get(row.deobfuscated_name.unwrap_or(row.name))
            }
            None => "[unknown]",
        }
    }

    fn seq_mut(&mut self, seq: u64) -> &mut SequenceState {
        self.sequences
            .entry(seq)
            .or_insert_with(SequenceState::default)
    }

    pub fn add_interned_location_name(&mut self, seq: u64, iid: u64, name: &str) {
        let id = self.strings.intern(name);
        self.seq_mut(seq).interned_location_names.insert(iid, id);
    }

    pub fn add_interned_type(&mut self, seq: u64, iid: u64, name: &str, location_iid: Option<u64>) {
        let name = self.strings.intern(name);
        self.seq_mut(seq)
            .interned_types
            .insert(iid, InternedType { name, location_iid });
    }

    /// Field strings optionally carry the declaring type: "Type fieldname".
    pub fn add_interned_field_name(&mut self, seq: u64, iid: u64, field: &str) {
        let (type_part, name_part) = match field.find(' ') {
            Some(split) => (Some(&field[..split]), &field[split + 1..]),
            None => (None, field),
        };
        let field_name = self.strings.intern(name_part);
        let field_type_name = type_part.map(|t| self.strings.intern(t));
        self.seq_mut(seq).interned_field_names.insert(
            iid,
            InternedField {
                field_name,
                field_type_name,
            },
        );
    }

    /// Packet indices must be gapless from 0 per sequence; a jump means the
    /// transport dropped data and the graph may be missing edges.
    pub fn set_packet_index(&mut self, seq: u64, index: u64) {
        let expected = {
            let state = self.seq_mut(seq);
            let expected = state.packet_index.map(|i| i + 1).unwrap_or(0);
            state.packet_index = Some(index);
            expected
        };
        if index != expected {
            self.stats.dropped_packets += 1;
            warn!(
                "sequence {} jumped from packet {} to {}",
                seq, expected, index
            );
        }
    }

    /// Pins the sequence to its single (upid, ts), dropping frames that
    /// disagree.
    fn begin_frame(&mut self, seq: u64, upid: u32, ts: i64) -> bool {
        let mismatch = {
            let state = self.seq_mut(seq);
            match state.current {
                Some(scope) if scope != (upid, ts) => true,
                _ => {
                    state.current = Some((upid, ts));
                    false
                }
            }
        };
        if mismatch {
            self.stats.upid_ts_mismatch += 1;
            warn!(
                "sequence {} got a frame for ({}, {}) but is pinned elsewhere",
                seq, upid, ts
            );
        }
        !mismatch
    }

    /// Upserts the object row and appends its outbound references. All of
    /// one owner's reference rows are contiguous and tagged with the table
    /// index that preceded the first of them.
    pub fn add_object(&mut self, seq: u64, upid: u32, ts: i64, source: SourceObject) {
        if !self.begin_frame(seq, upid, ts) {
            return;
        }

        let HeapGraphTracker {
            ref mut strings,
            ref mut objects,
            ref mut references,
            ref mut classes,
            ref mut sequences,
            ..
        } = *self;
        let state = sequences.get_mut(&seq).expect("begin_frame pinned it");

        let owner = upsert_object(objects, &mut state.wire_object_ids, source.object_id, upid, ts);
        let class = get_or_create_class(classes, strings, &mut state.type_classes, source.type_iid);
        {
            let row = &mut objects[owner.0 as usize];
            row.self_size = source.self_size;
            row.type_id = Some(class);
        }

        let reference_set_id = references.len() as u32;
        let mut first_reference = true;
        for reference in &source.references {
            if reference.owned_object_id == 0 {
                // null field
                continue;
            }
            let owned = upsert_object(
                objects,
                &mut state.wire_object_ids,
                reference.owned_object_id,
                upid,
                ts,
            );
            if first_reference {
                objects[owner.0 as usize].reference_set_id = Some(reference_set_id);
                first_reference = false;
            }
            let field = reference
                .field_name_iid
                .and_then(|iid| state.interned_field_names.get(&iid).cloned());
            references.push(ReferenceRow {
                reference_set_id,
                owner_id: owner,
                owned_id: owned,
                field_name: field.map(|f| f.field_name),
                field_type_name: field.and_then(|f| f.field_type_name),
            });
        }
    }

    /// Roots are buffered raw; wire ids cannot be translated until the
    /// object frames have all arrived.
    pub fn add_root(&mut self, seq: u64, upid: u32, ts: i64, root: SourceRoot) {
        if !self.begin_frame(seq, upid, ts) {
            return;
        }
        self.seq_mut(seq).pending_roots.push(root);
    }

    /// Ends a sequence: names its classes, applies its buffered roots, and
    /// discards its interning state.
    pub fn finalize_profile(&mut self, seq: u64) {
        let mut state = match self.sequences.remove(&seq) {
            Some(state) => state,
            None => return,
        };

        let type_iids: Vec<u64> = state.interned_types.keys().cloned().collect();
        for iid in type_iids {
            let interned = state.interned_types[&iid];
            let location = match interned.location_iid {
                Some(location_iid) => match state.interned_location_names.get(&location_iid) {
                    Some(&location) => Some(location),
                    None => {
                        self.stats.unknown_location_iid += 1;
                        None
                    }
                },
                None => None,
            };

            let class_id = {
                let HeapGraphTracker {
                    ref mut strings,
                    ref mut classes,
                    ..
                } = *self;
                get_or_create_class(classes, strings, &mut state.type_classes, iid)
            };
            let package = location
                .map(|id| self.strings.get(id).to_string())
                .and_then(|path| package_from_location(&path))
                .map(|package| self.strings.intern(&package));

            let class = &mut self.classes[class_id.0 as usize];
            class.name = interned.name;
            class.location = location;
            class.package = package;
        }

        if let Some((upid, ts)) = state.current {
            let pending = mem::replace(&mut state.pending_roots, Vec::new());
            for root in pending {
                for wire_id in root.object_ids {
                    let object = match state.wire_object_ids.get(&wire_id) {
                        Some(&object) => object,
                        None => {
                            self.stats.roots_unresolved += 1;
                            continue;
                        }
                    };
                    self.roots
                        .entry((upid, ts))
                        .or_insert_with(Vec::new)
                        .push(object);
                    self.mark_root(object, root.root_type);
                }
            }
        }

        self.populate_superclasses();
    }

    /// Breadth-first root-distance propagation. Traversal state lives on the
    /// heap; retention chains get deep enough to kill the OS stack.
    fn mark_root(&mut self, root: ObjectId, root_type: RootType) {
        self.objects[root.0 as usize].root_type = Some(root_type);

        let mut queue: VecDeque<(i64, ObjectId)> = VecDeque::new();
        queue.push_back((0, root));

        while let Some((distance, id)) = queue.pop_front() {
            let (reference_set_id, node_distance) = {
                let node = &self.objects[id.0 as usize];
                (node.reference_set_id, node.root_distance)
            };
            // first writer wins at equal distance
            if node_distance != -1 && node_distance <= distance {
                continue;
            }
            {
                let node = &mut self.objects[id.0 as usize];
                node.reachable = true;
                node.root_distance = distance;
            }

            let set = match reference_set_id {
                Some(set) => set,
                None => continue,
            };
            let mut i = set as usize;
            while i < self.references.len() && self.references[i].reference_set_id == set {
                let child = self.references[i].owned_id;
                let child_distance = self.objects[child.0 as usize].root_distance;
                if child_distance == -1 || child_distance > distance + 1 {
                    queue.push_back((distance + 1, child));
                }
                i += 1;
            }
        }
    }

    /// Reads superclass edges off the `java.lang.Class<...>` object graph
    /// and writes them onto the plain class rows.
    fn populate_superclasses(&mut self) {
        let super_field = match self.strings.find(SUPERCLASS_FIELD) {
            Some(id) => id,
            None => return,
        };

        #[derive(Clone, Eq, Hash, PartialEq)]
        struct Descriptor {
            name: String,
            location: Option<StringId>,
        }

        let mut superclass_of: HashMap<Descriptor, Descriptor> = HashMap::new();
        for object in &self.objects {
            let class = match object.type_id {
                Some(id) => &self.classes[id.0 as usize],
                None => continue,
            };
            let norm = normalize::normalized_type(self.strings.get(class.name));
            if !norm.is_static_class || norm.number_of_arrays != 0 {
                continue;
            }
            let own = Descriptor {
                name: norm.name.to_string(),
                location: class.location,
            };

            let set = match object.reference_set_id {
                Some(set) => set,
                None => continue,
            };
            let mut i = set as usize;
            while i < self.references.len() && self.references[i].reference_set_id == set {
                let reference = &self.references[i];
                if reference.field_name == Some(super_field) {
                    let super_object = &self.objects[reference.owned_id.0 as usize];
                    if let Some(super_class_id) = super_object.type_id {
                        let super_class = &self.classes[super_class_id.0 as usize];
                        let super_norm =
                            normalize::normalized_type(self.strings.get(super_class.name));
                        if super_norm.is_static_class && super_norm.number_of_arrays == 0 {
                            superclass_of.insert(
                                own.clone(),
                                Descriptor {
                                    name: super_norm.name.to_string(),
                                    location: super_class.location,
                                },
                            );
                        }
                    }
                    break;
                }
                i += 1;
            }
        }

        if superclass_of.is_empty() {
            return;
        }

        let mut row_of: HashMap<Descriptor, ClassId> = HashMap::new();
        for (idx, class) in self.classes.iter().enumerate() {
            let norm = normalize::normalized_type(self.strings.get(class.name));
            if norm.is_plain_class() && !norm.name.is_empty() {
                row_of
                    .entry(Descriptor {
                        name: norm.name.to_string(),
                        location: class.location,
                    })
                    .or_insert(ClassId(idx as u32));
            }
        }

        for idx in 0..self.classes.len() {
            let descriptor = {
                let class = &self.classes[idx];
                let norm = normalize::normalized_type(self.strings.get(class.name));
                if !norm.is_plain_class() || norm.name.is_empty() {
                    continue;
                }
                Descriptor {
                    name: norm.name.to_string(),
                    location: class.location,
                }
            };
            if let Some(super_descriptor) = superclass_of.get(&descriptor) {
                if let Some(&super_id) = row_of.get(super_descriptor) {
                    self.classes[idx].superclass_id = Some(super_id);
                }
            }
        }
    }

    /// Registers a mapping and back-fills classes already materialized.
    /// Decoration (arrays, static-class wrapper) is stripped before the
    /// lookup and reapplied to the result.
    pub fn add_deobfuscation_mapping(
        &mut self,
        package: Option<&str>,
        obfuscated: &str,
        deobfuscated: &str,
    ) {
        self.deobfuscation.insert(
            (package.map(str::to_string), obfuscated.to_string()),
            deobfuscated.to_string(),
        );

        for idx in 0..self.classes.len() {
            let decorated = {
                let class = &self.classes[idx];
                let name = self.strings.get(class.name);
                let norm = normalize::normalized_type(name);
                if norm.name != obfuscated {
                    continue;
                }
                let package_matches = match package {
                    Some(wanted) => match class.package {
                        Some(have) => self.strings.get(have) == wanted,
                        None => false,
                    },
                    None => true,
                };
                if !package_matches {
                    continue;
                }
                normalize::denormalized_type_name(&norm, deobfuscated)
            };
            let id = self.strings.intern(&decorated);
            self.classes[idx].deobfuscated_name = Some(id);
        }
    }

    /// Looks a type name up in the deobfuscation map: exact package first,
    /// then the package-less entries. Misses return the input unchanged.
    pub fn maybe_deobfuscate(&self, package: Option<&str>, type_name: &str) -> String {
        let norm = normalize::normalized_type(type_name);
        let mapped = package
            .and_then(|p| {
                self.deobfuscation
                    .get(&(Some(p.to_string()), norm.name.to_string()))
            })
            .or_else(|| self.deobfuscation.get(&(None, norm.name.to_string())));
        match mapped {
            Some(name) => normalize::denormalized_type_name(&norm, name),
            None => type_name.to_string(),
        }
    }
}
