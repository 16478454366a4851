//! Overlay Trees
//!
//! A [`Topology`] is an immutable tree over dense core ids. It is built
//! either from a [`Model`] matrix or as the default binary tree, and carries
//! everything the collectives need per core: upstream, ordered children,
//! cluster membership and [`Roles`].
//!
//! # Hybrid Trees
//!
//! ```text
//!                0  (root, coordinates cluster 0)
//!           ┌────┼─────────┐
//!      mp   │    │ shm     │ shm
//!           3    1         2
//! ```
//!
//! A node's upstream is its message-passing parent or, for a cluster member,
//! its coordinator. Its children are its message-passing children in fan-out
//! order followed by the members of the cluster it coordinates in core order.

mod model;
mod roles;

pub use model::{EdgeKind, Model};
pub use roles::Roles;

use std::collections::{BTreeMap, VecDeque};

use crate::{ClusterId, CoreId, Error, Result};

/// One node of a [`Topology`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNode {
    node_id: CoreId,
    parent: Option<CoreId>,
    children: Vec<CoreId>,
    num_mp_children: usize,
    array_index: usize,
    is_leaf: bool,
    member_of: Option<ClusterId>,
    coordinates: Option<ClusterId>,
}

impl TopologyNode {
    /// The node's core id.
    pub fn node_id(&self) -> CoreId {
        self.node_id
    }

    /// Upstream node; `None` for the root.
    pub fn parent(&self) -> Option<CoreId> {
        self.parent
    }

    /// All children in fan-out order.
    pub fn children(&self) -> &[CoreId] {
        &self.children
    }

    /// Children reached over message passing, in fan-out order.
    pub fn mp_children(&self) -> &[CoreId] {
        &self.children[..self.num_mp_children]
    }

    /// Members of the cluster this node coordinates, in core order.
    pub fn cluster_members(&self) -> &[CoreId] {
        &self.children[self.num_mp_children..]
    }

    /// The parent, if it is reached over message passing.
    pub fn mp_parent(&self) -> Option<CoreId> {
        match self.member_of {
            Some(_) => None,
            None => self.parent,
        }
    }

    /// Position among the parent's children; 0 for the root.
    pub fn array_index(&self) -> usize {
        self.array_index
    }

    /// Whether the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    /// Cluster this node is a member of.
    pub fn member_of(&self) -> Option<ClusterId> {
        self.member_of
    }

    /// Cluster this node coordinates.
    pub fn coordinates(&self) -> Option<ClusterId> {
        self.coordinates
    }
}

/// A shared-memory cluster as declared by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    /// Cluster id
    pub id: ClusterId,
    /// Coordinating core
    pub coordinator: CoreId,
    /// Member cores, ascending
    pub members: Vec<CoreId>,
}

/// An immutable overlay tree.
#[derive(Debug, Clone)]
pub struct Topology {
    name: String,
    root: CoreId,
    nodes: Vec<TopologyNode>,
    roles: Vec<Roles>,
    clusters: Vec<ClusterSpec>,
    model: Model,
}

fn invalid(msg: String) -> Error {
    Error::InvalidModel(msg)
}

impl Topology {
    /// Builds the binary tree over `num_nodes` nodes rooted at 0.
    pub fn build_binary_tree(num_nodes: usize, name: impl Into<String>) -> Result<Self> {
        Self::build_from_model(&Model::binary(num_nodes)?, name)
    }

    /// Builds and validates a topology from a model matrix.
    pub fn build_from_model(model: &Model, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let n = model.num_nodes();
        let root = model.root();

        let mut mp_parent: Vec<Option<CoreId>> = vec![None; n];
        let mut mp_children: Vec<Vec<(u8, CoreId)>> = vec![Vec::new(); n];
        let mut member_of: Vec<Option<(ClusterId, CoreId)>> = vec![None; n];
        let mut coordinates: Vec<Option<ClusterId>> = vec![None; n];
        let mut coordinators: BTreeMap<ClusterId, CoreId> = BTreeMap::new();
        let mut members: BTreeMap<ClusterId, Vec<CoreId>> = BTreeMap::new();

        for x in 0..n {
            for edge in model.edges(x) {
                let (y, kind) = edge?;
                if y == x {
                    return Err(invalid(format!("node {x} has an edge to itself")));
                }
                let reverse = EdgeKind::decode(model.cell(y, x))?;

                match kind {
                    EdgeKind::Parent => {
                        if !matches!(reverse, Some(EdgeKind::Child(_))) {
                            return Err(invalid(format!(
                                "node {x} names {y} as parent, but {y} does not list it as a child"
                            )));
                        }
                        if mp_parent[x].replace(y).is_some() {
                            return Err(invalid(format!("node {x} has more than one parent")));
                        }
                    }
                    EdgeKind::Child(order) => {
                        if reverse != Some(EdgeKind::Parent) {
                            return Err(invalid(format!(
                                "node {x} lists {y} as a child, but {y} does not name it as parent"
                            )));
                        }
                        if mp_children[x].iter().any(|&(o, _)| o == order) {
                            return Err(invalid(format!(
                                "node {x} has two children with order {order}"
                            )));
                        }
                        mp_children[x].push((order, y));
                    }
                    EdgeKind::ShmCoordinator(cluster) => {
                        if reverse != Some(EdgeKind::ShmMember(cluster)) {
                            return Err(invalid(format!(
                                "node {x} marks {y} as a member of cluster {cluster}, but {y} does not agree"
                            )));
                        }
                        match coordinates[x] {
                            Some(other) if other != cluster => {
                                return Err(invalid(format!(
                                    "node {x} coordinates clusters {other} and {cluster}"
                                )));
                            }
                            _ => coordinates[x] = Some(cluster),
                        }
                        let coordinator = *coordinators.entry(cluster).or_insert(x);
                        if coordinator != x {
                            return Err(invalid(format!(
                                "cluster {cluster} has coordinators {coordinator} and {x}"
                            )));
                        }
                    }
                    EdgeKind::ShmMember(cluster) => {
                        if reverse != Some(EdgeKind::ShmCoordinator(cluster)) {
                            return Err(invalid(format!(
                                "node {x} names {y} as coordinator of cluster {cluster}, but {y} does not agree"
                            )));
                        }
                        if member_of[x].replace((cluster, y)).is_some() {
                            return Err(invalid(format!(
                                "node {x} is a member of more than one cluster"
                            )));
                        }
                        members.entry(cluster).or_default().push(x);
                    }
                }
            }
        }

        for x in 0..n {
            let upstreams = mp_parent[x].is_some() as usize + member_of[x].is_some() as usize;
            match (x == root, upstreams) {
                (true, 0) | (false, 1) => {}
                (true, _) => return Err(invalid(format!("root {x} has an upstream"))),
                (false, 0) => return Err(invalid(format!("node {x} has no upstream"))),
                (false, _) => {
                    return Err(invalid(format!(
                        "node {x} has both a parent and a coordinator"
                    )))
                }
            }
        }

        let mut nodes: Vec<TopologyNode> = (0..n)
            .map(|x| {
                let mut ordered = std::mem::take(&mut mp_children[x]);
                ordered.sort_unstable();
                let num_mp_children = ordered.len();

                let mut children: Vec<CoreId> = ordered.into_iter().map(|(_, c)| c).collect();
                if let Some(cluster) = coordinates[x] {
                    children.extend(members.get(&cluster).into_iter().flatten().copied());
                }

                TopologyNode {
                    node_id: x,
                    parent: mp_parent[x].or(member_of[x].map(|(_, coordinator)| coordinator)),
                    is_leaf: children.is_empty(),
                    children,
                    num_mp_children,
                    array_index: 0,
                    member_of: member_of[x].map(|(cluster, _)| cluster),
                    coordinates: coordinates[x],
                }
            })
            .collect();

        for x in 0..n {
            for i in 0..nodes[x].children.len() {
                let child = nodes[x].children[i];
                nodes[child].array_index = i;
            }
        }

        let mut seen = vec![false; n];
        let mut queue = VecDeque::from([root]);
        let mut visited = 1;
        seen[root] = true;
        while let Some(x) = queue.pop_front() {
            for &child in &nodes[x].children {
                if seen[child] {
                    return Err(invalid(format!("node {child} is reachable twice")));
                }
                seen[child] = true;
                visited += 1;
                queue.push_back(child);
            }
        }
        if visited != n {
            let unreachable: Vec<CoreId> = (0..n).filter(|&x| !seen[x]).collect();
            return Err(invalid(format!(
                "nodes {unreachable:?} are not reachable from root {root}"
            )));
        }

        // The leaf list may be zero-padded; a listed root is padding.
        for &leaf in model.leafs() {
            if leaf == root {
                continue;
            }
            match nodes.get(leaf) {
                None => return Err(invalid(format!("leaf {leaf} outside {n} nodes"))),
                Some(node) if !node.is_leaf => {
                    return Err(invalid(format!("leaf {leaf} has children")))
                }
                Some(_) => {}
            }
        }

        let roles = (0..n)
            .map(|x| Roles::classify(model, x))
            .collect::<Result<Vec<_>>>()?;

        let clusters: Vec<ClusterSpec> = coordinators
            .into_iter()
            .map(|(id, coordinator)| ClusterSpec {
                id,
                coordinator,
                members: members.remove(&id).unwrap_or_default(),
            })
            .collect();

        tracing::debug!(
            name = %name,
            nodes = n,
            root,
            clusters = clusters.len(),
            "topology built"
        );

        Ok(Self {
            name,
            root,
            nodes,
            roles,
            clusters,
            model: model.clone(),
        })
    }

    /// Topology name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// The root (sequentializer).
    pub fn root(&self) -> CoreId {
        self.root
    }

    /// Node `id`.
    pub fn node(&self, id: CoreId) -> Result<&TopologyNode> {
        self.nodes.get(id).ok_or(Error::UnknownCore(id))
    }

    /// All nodes, indexed by core id.
    pub fn nodes(&self) -> &[TopologyNode] {
        &self.nodes
    }

    /// Upstream of `id`.
    pub fn parent(&self, id: CoreId) -> Option<CoreId> {
        self.nodes.get(id).and_then(TopologyNode::parent)
    }

    /// Children of `id` in fan-out order.
    pub fn children(&self, id: CoreId) -> &[CoreId] {
        self.nodes.get(id).map(TopologyNode::children).unwrap_or(&[])
    }

    /// Roles of `id`.
    pub fn roles(&self, id: CoreId) -> Result<Roles> {
        self.roles.get(id).copied().ok_or(Error::UnknownCore(id))
    }

    /// Shared-memory clusters, by ascending id.
    pub fn clusters(&self) -> &[ClusterSpec] {
        &self.clusters
    }

    /// The model this topology was built from.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Hops from `id` up to the root.
    pub fn depth(&self, id: CoreId) -> usize {
        let mut depth = 0;
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            depth += 1;
            current = parent;
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hybrid_model() -> Model {
        Model::new(
            vec![
                vec![0, 70, 70, 1],
                vec![50, 0, 0, 0],
                vec![50, 0, 0, 0],
                vec![99, 0, 0, 0],
            ],
            vec![1, 2, 3, 0],
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_binary_tree_shape() {
        for n in 1..=64 {
            let topo = Topology::build_binary_tree(n, "binary").unwrap();
            assert_eq!(topo.root(), 0);
            assert_eq!(topo.parent(0), None);

            for i in 1..n {
                assert_eq!(topo.parent(i), Some((i - 1) / 2), "n={n} i={i}");
                assert_eq!(topo.node(i).unwrap().array_index(), (i - 1) % 2);
            }
            for i in 0..n {
                let expected: Vec<_> = [2 * i + 1, 2 * i + 2]
                    .into_iter()
                    .filter(|&c| c < n)
                    .collect();
                assert_eq!(topo.children(i), expected.as_slice());
                assert_eq!(topo.node(i).unwrap().is_leaf(), expected.is_empty());
            }
            assert_eq!(topo.nodes().iter().filter(|node| node.parent().is_none()).count(), 1);
        }
    }

    #[test]
    fn test_hybrid_model() {
        let topo = Topology::build_from_model(&hybrid_model(), "hybrid").unwrap();

        let root = topo.node(0).unwrap();
        assert_eq!(root.children(), &[3, 1, 2]);
        assert_eq!(root.mp_children(), &[3]);
        assert_eq!(root.cluster_members(), &[1, 2]);
        assert_eq!(root.coordinates(), Some(0));

        assert_eq!(topo.parent(1), Some(0));
        assert_eq!(topo.parent(2), Some(0));
        assert_eq!(topo.parent(3), Some(0));
        assert_eq!(topo.node(2).unwrap().mp_parent(), None);
        assert_eq!(topo.node(3).unwrap().mp_parent(), Some(0));
        assert_eq!(topo.node(2).unwrap().array_index(), 2);

        assert_eq!(
            topo.clusters(),
            &[ClusterSpec {
                id: 0,
                coordinator: 0,
                members: vec![1, 2]
            }]
        );
        assert!(topo.roles(0).unwrap().is_hybrid());
        assert_eq!(topo.depth(2), 1);
    }

    #[test]
    fn test_child_order_decides_fan_out() {
        let model = Model::new(
            vec![vec![0, 2, 1], vec![99, 0, 0], vec![99, 0, 0]],
            vec![1, 2],
            0,
        )
        .unwrap();
        let topo = Topology::build_from_model(&model, "ordered").unwrap();
        assert_eq!(topo.children(0), &[2, 1]);
        assert_eq!(topo.node(1).unwrap().array_index(), 1);
    }

    #[test]
    fn test_single_node_root_is_leaf() {
        let model = Model::new(vec![vec![0]], vec![0], 0).unwrap();
        let topo = Topology::build_from_model(&model, "single").unwrap();
        assert!(topo.node(0).unwrap().is_leaf());
    }

    #[test]
    fn test_rejects_cycle() {
        let model = Model::new(
            vec![
                vec![0, 0, 0, 0],
                vec![0, 0, 99, 1],
                vec![0, 1, 0, 99],
                vec![0, 99, 1, 0],
            ],
            vec![],
            0,
        )
        .unwrap();
        let err = Topology::build_from_model(&model, "cycle").unwrap_err();
        assert!(matches!(err, Error::InvalidModel(_)));
    }

    #[test]
    fn test_rejects_inconsistent_models() {
        let cases: Vec<Vec<Vec<u16>>> = vec![
            // missing parent
            vec![vec![0, 0], vec![0, 0]],
            // duplicate child order
            vec![vec![0, 1, 1], vec![99, 0, 0], vec![99, 0, 0]],
            // parent without matching child edge
            vec![vec![0, 0], vec![99, 0]],
            // root with a parent
            vec![vec![0, 99], vec![1, 0]],
            // two coordinators for one cluster
            vec![vec![0, 70, 0], vec![50, 0, 70], vec![0, 50, 0]],
            // parent and coordinator at once
            vec![vec![0, 1, 2], vec![99, 0, 70], vec![99, 50, 0]],
            // unknown sentinel
            vec![vec![0, 95], vec![99, 0]],
        ];

        for (i, rows) in cases.into_iter().enumerate() {
            let model = Model::new(rows, vec![], 0).unwrap();
            assert!(
                matches!(Topology::build_from_model(&model, "bad"), Err(Error::InvalidModel(_))),
                "case {i} accepted"
            );
        }
    }

    #[test]
    fn test_rejects_leaf_with_children() {
        let binary = Model::binary(4).unwrap();
        let rows: Vec<Vec<u16>> = (0..4).map(|x| binary.row(x).to_vec()).collect();
        let model = Model::new(rows, vec![1, 2, 3], 0).unwrap();
        assert!(matches!(
            Topology::build_from_model(&model, "leafs"),
            Err(Error::InvalidModel(_))
        ));
    }
}
