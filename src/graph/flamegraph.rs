//! Folding retention into a flamegraph tree.
//!
//! Every heap object contributes its self size to exactly one node of the
//! result: the node reached by following the shortest-path spanning tree
//! edge from its parent. Objects of the same class under the same tree
//! parent merge, which is what turns a million-object graph into a readable
//! flamegraph.

use std::collections::HashMap;

use graph::tracker::HeapGraphTracker;
use graph::{ClassId, ObjectId};

pub const MAP_NAME: &str = "JAVA";
pub const PROFILE_TYPE: &str = "graph";

/// One emitted flamegraph node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FlamegraphRow {
    pub id: u32,
    pub depth: u32,
    pub name: String,
    pub map_name: &'static str,
    pub count: u64,
    pub cumulative_count: u64,
    pub size: u64,
    pub cumulative_size: u64,
    pub parent_id: Option<u32>,
    pub profile_type: &'static str,
}

struct TreeNode {
    parent: usize,
    name: String,
    depth: u32,
    size: u64,
    count: u64,
    cumulative_size: u64,
    cumulative_count: u64,
    children: HashMap<Option<ClassId>, usize>,
}

/// One level of the explicit traversal stack.
struct Frame {
    object: usize,
    tree_parent: usize,
    /// 0 (the artificial root, never a child) until this frame's object has
    /// been accounted into the tree.
    tree_node: usize,
    next_child: usize,
    children: Vec<usize>,
}

fn add_child(
    nodes: &mut Vec<TreeNode>,
    parent: usize,
    class: Option<ClassId>,
    name: &str,
    size: u64,
) -> usize {
    if let Some(&existing) = nodes[parent].children.get(&class) {
        nodes[existing].size += size;
        nodes[existing].count += 1;
        return existing;
    }
    let depth = nodes[parent].depth + 1;
    let idx = nodes.len();
    nodes.push(TreeNode {
        parent,
        name: name.to_string(),
        depth,
        size,
        count: 1,
        cumulative_size: 0,
        cumulative_count: 0,
        children: HashMap::new(),
    });
    nodes[parent].children.insert(class, idx);
    idx
}

impl HeapGraphTracker {
    /// Builds the retention flamegraph for one (upid, ts) snapshot. Empty
    /// when the snapshot has no recorded roots.
    pub fn build_flamegraph(&self, upid: u32, ts: i64) -> Vec<FlamegraphRow> {
        let roots = match self.roots_for(upid, ts) {
            Some(roots) => roots,
            None => return Vec::new(),
        };

        let mut nodes = vec![TreeNode {
            parent: 0,
            name: String::new(),
            depth: 0,
            size: 0,
            count: 0,
            cumulative_size: 0,
            cumulative_count: 0,
            children: HashMap::new(),
        }];
        let mut visited = vec![false; self.objects().len()];

        for &root in roots {
            self.fold_from_root(root, &mut nodes, &mut visited);
        }

        // children always sit at higher indices than their parents, so one
        // reverse sweep folds the cumulative totals
        for idx in 0..nodes.len() {
            nodes[idx].cumulative_size = nodes[idx].size;
            nodes[idx].cumulative_count = nodes[idx].count;
        }
        for idx in (1..nodes.len()).rev() {
            let parent = nodes[idx].parent;
            let (size, count) = (nodes[idx].cumulative_size, nodes[idx].cumulative_count);
            nodes[parent].cumulative_size += size;
            nodes[parent].cumulative_count += count;
        }

        nodes
            .iter()
            .enumerate()
            .skip(1) // the artificial root is bookkeeping, not output
            .map(|(idx, node)| FlamegraphRow {
                id: idx as u32,
                depth: node.depth,
                name: node.name.clone(),
                map_name: MAP_NAME,
                count: node.count,
                cumulative_count: node.cumulative_count,
                size: node.size,
                cumulative_size: node.cumulative_size,
                parent_id: if node.parent == 0 {
                    None
                } else {
                    Some(node.parent as u32)
                },
                profile_type: PROFILE_TYPE,
            })
            .collect()
    }

    /// Walks the shortest-path spanning tree from one root. The traversal
    /// stack is an explicit heap-allocated structure: real retention chains
    /// run tens of thousands of edges deep, far past what recursion
    /// survives.
    fn fold_from_root(&self, root: ObjectId, nodes: &mut Vec<TreeNode>, visited: &mut Vec<bool>) {
        let objects = self.objects();
        let references = self.references();

        let root_idx = root.0 as usize;
        if visited[root_idx] {
            return;
        }
        visited[root_idx] = true;

        let mut stack = vec![Frame {
            object: root_idx,
            tree_parent: 0,
            tree_node: 0,
            next_child: 0,
            children: Vec::new(),
        }];

        while !stack.is_empty() {
            let top = stack.len() - 1;

            if stack[top].tree_node == 0 {
                // first time at this frame: account the object into the
                // tree and enumerate which edges belong to the spanning tree
                let object = &objects[stack[top].object];
                let class = object.type_id;
                let tree_parent = stack[top].tree_parent;
                let node = {
                    let name = self.class_display_name(class);
                    add_child(nodes, tree_parent, class, name, object.self_size)
                };
                stack[top].tree_node = node;

                let mut children = Vec::new();
                if let Some(set) = object.reference_set_id {
                    let mut i = set as usize;
                    while i < references.len() && references[i].reference_set_id == set {
                        let child = references[i].owned_id.0 as usize;
                        if objects[child].root_distance == object.root_distance + 1 {
                            children.push(child);
                        }
                        i += 1;
                    }
                }
                stack[top].children = children;
            }

            if stack[top].next_child < stack[top].children.len() {
                let child = stack[top].children[stack[top].next_child];
                stack[top].next_child += 1;
                if !visited[child] {
                    visited[child] = true;
                    let tree_parent = stack[top].tree_node;
                    stack.push(Frame {
                        object: child,
                        tree_parent,
                        tree_node: 0,
                        next_child: 0,
                        children: Vec::new(),
                    });
                }
            } else {
                stack.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use graph::{RootType, SourceObject, SourceReference, SourceRoot};

    use super::*;

    fn object(id: u64, type_iid: u64, size: u64, refs: &[u64]) -> SourceObject {
        SourceObject {
            object_id: id,
            type_iid,
            self_size: size,
            references: refs
                .iter()
                .map(|&owned_object_id| SourceReference {
                    field_name_iid: None,
                    owned_object_id,
                })
                .collect(),
        }
    }

    fn root(ids: &[u64]) -> SourceRoot {
        SourceRoot {
            root_type: RootType::Global,
            object_ids: ids.to_vec(),
        }
    }

    #[test]
    fn two_level_chain_folds_into_two_rows() {
        let mut tracker = HeapGraphTracker::new();
        tracker.add_interned_type(1, 1, "A", None);
        tracker.add_interned_type(1, 2, "B", None);
        tracker.add_object(1, 42, 1000, object(1, 1, 8, &[2]));
        tracker.add_object(1, 42, 1000, object(2, 2, 16, &[]));
        tracker.add_root(1, 42, 1000, root(&[1]));
        tracker.finalize_profile(1);

        let rows = tracker.build_flamegraph(42, 1000);
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].depth, 1);
        assert_eq!(rows[0].name, "A");
        assert_eq!(rows[0].size, 8);
        assert_eq!(rows[0].count, 1);
        assert_eq!(rows[0].cumulative_size, 24);
        assert_eq!(rows[0].cumulative_count, 2);
        assert_eq!(rows[0].parent_id, None);
        assert_eq!(rows[0].profile_type, "graph");
        assert_eq!(rows[0].map_name, "JAVA");

        assert_eq!(rows[1].depth, 2);
        assert_eq!(rows[1].name, "B");
        assert_eq!(rows[1].size, 16);
        assert_eq!(rows[1].cumulative_size, 16);
        assert_eq!(rows[1].parent_id, Some(rows[0].id));
    }

    #[test]
    fn unknown_snapshot_yields_no_rows() {
        let tracker = HeapGraphTracker::new();
        assert!(tracker.build_flamegraph(1, 1).is_empty());
    }

    #[test]
    fn same_class_children_merge_under_one_node() {
        // root A holds three Bs, one of which holds a C
        let mut tracker = HeapGraphTracker::new();
        tracker.add_interned_type(1, 1, "A", None);
        tracker.add_interned_type(1, 2, "B", None);
        tracker.add_interned_type(1, 3, "C", None);
        tracker.add_object(1, 42, 1000, object(1, 1, 10, &[2, 3, 4]));
        tracker.add_object(1, 42, 1000, object(2, 2, 5, &[]));
        tracker.add_object(1, 42, 1000, object(3, 2, 5, &[5]));
        tracker.add_object(1, 42, 1000, object(4, 2, 5, &[]));
        tracker.add_object(1, 42, 1000, object(5, 3, 7, &[]));
        tracker.add_root(1, 42, 1000, root(&[1]));
        tracker.finalize_profile(1);

        let rows = tracker.build_flamegraph(42, 1000);
        assert_eq!(rows.len(), 3);

        let a = rows.iter().find(|row| row.name == "A").expect("A row");
        let b = rows.iter().find(|row| row.name == "B").expect("B row");
        let c = rows.iter().find(|row| row.name == "C").expect("C row");

        assert_eq!(b.count, 3, "three Bs merged into one node");
        assert_eq!(b.size, 15);
        assert_eq!(b.parent_id, Some(a.id));
        assert_eq!(c.parent_id, Some(b.id));

        // cumulative size at a node is its self size plus its children's
        assert_eq!(c.cumulative_size, 7);
        assert_eq!(b.cumulative_size, b.size + c.cumulative_size);
        assert_eq!(a.cumulative_size, a.size + b.cumulative_size);
        assert_eq!(a.cumulative_count, 5);
    }

    #[test]
    fn each_object_counts_exactly_once_across_roots() {
        // two roots that can both reach the same object
        let mut tracker = HeapGraphTracker::new();
        tracker.add_interned_type(1, 1, "A", None);
        tracker.add_object(1, 42, 1000, object(1, 1, 1, &[3]));
        tracker.add_object(1, 42, 1000, object(2, 1, 1, &[3]));
        tracker.add_object(1, 42, 1000, object(3, 1, 1, &[]));
        tracker.add_root(1, 42, 1000, root(&[1, 2]));
        tracker.finalize_profile(1);

        let rows = tracker.build_flamegraph(42, 1000);
        let total_count: u64 = rows.iter().map(|row| row.count).sum();
        let total_size: u64 = rows.iter().map(|row| row.size).sum();
        assert_eq!(total_count, 3);
        assert_eq!(total_size, 3);
    }

    #[test]
    fn deobfuscated_names_win_in_rows() {
        let mut tracker = HeapGraphTracker::new();
        tracker.add_interned_type(1, 1, "a.a", None);
        tracker.add_object(1, 42, 1000, object(1, 1, 4, &[]));
        tracker.add_root(1, 42, 1000, root(&[1]));
        tracker.finalize_profile(1);
        tracker.add_deobfuscation_mapping(None, "a.a", "com.example.Cache");

        let rows = tracker.build_flamegraph(42, 1000);
        assert_eq!(rows[0].name, "com.example.Cache");
    }
}
