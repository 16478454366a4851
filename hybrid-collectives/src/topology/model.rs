//! Model matrices: the external description of an overlay tree.
//!
//! Cell `[x][y]` of an `N×N` matrix describes the edge from row `x` to column `y`:
//!
//! | value      | edge                                         |
//! |------------|----------------------------------------------|
//! | `0`        | none                                         |
//! | `1..=49`   | `y` is the `v`-th message-passing child of `x` |
//! | `50..=69`  | `x` is a member of cluster `v-50`, coordinated by `y` |
//! | `70..=89`  | `x` coordinates cluster `v-70`, `y` is a member |
//! | `99`       | `y` is the message-passing parent of `x`     |

use std::path::Path;

use serde::Deserialize;

use crate::config::{
    MAX_CLUSTERS, MODEL_CHILD_MAX, MODEL_PARENT, SHM_COORDINATOR_END, SHM_COORDINATOR_START,
    SHM_MEMBER_START,
};
use crate::{ClusterId, CoreId, Error, Result};

/// Decoded model cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// The column is the row's message-passing parent
    Parent,
    /// The column is the row's child with this 1-based fan-out order
    Child(u8),
    /// The row coordinates this cluster; the column is a member
    ShmCoordinator(ClusterId),
    /// The row is a member of this cluster; the column is its coordinator
    ShmMember(ClusterId),
}

impl EdgeKind {
    /// Decodes a raw cell. `Ok(None)` means no edge.
    pub fn decode(value: u16) -> Result<Option<Self>> {
        let kind = match value {
            0 => return Ok(None),
            MODEL_PARENT => EdgeKind::Parent,
            1..=MODEL_CHILD_MAX => EdgeKind::Child(value as u8),
            v if (SHM_MEMBER_START..SHM_COORDINATOR_START).contains(&v) => {
                EdgeKind::ShmMember((v - SHM_MEMBER_START) as ClusterId)
            }
            v if (SHM_COORDINATOR_START..SHM_COORDINATOR_END).contains(&v) => {
                EdgeKind::ShmCoordinator((v - SHM_COORDINATOR_START) as ClusterId)
            }
            v => return Err(Error::InvalidModel(format!("unknown cell value {v}"))),
        };
        Ok(Some(kind))
    }

    /// Encodes back to a raw cell.
    pub fn encode(self) -> u16 {
        match self {
            EdgeKind::Parent => MODEL_PARENT,
            EdgeKind::Child(order) => order as u16,
            EdgeKind::ShmMember(cluster) => SHM_MEMBER_START + cluster as u16,
            EdgeKind::ShmCoordinator(cluster) => SHM_COORDINATOR_START + cluster as u16,
        }
    }
}

/// An `N×N` model matrix with its leaf list and root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    num_nodes: usize,
    cells: Vec<u16>,
    leafs: Vec<CoreId>,
    root: CoreId,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMatrix {
    Nested(Vec<Vec<u16>>),
    Flat(Vec<u16>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModel {
    model: RawMatrix,
    #[serde(default, alias = "leaves")]
    leafs: Vec<CoreId>,
    #[serde(default)]
    root: CoreId,
    #[serde(default)]
    len: Option<usize>,
}

impl Model {
    /// Builds a model from matrix rows.
    pub fn new(matrix: Vec<Vec<u16>>, leafs: Vec<CoreId>, root: CoreId) -> Result<Self> {
        let num_nodes = matrix.len();
        if let Some((row, cells)) = matrix
            .iter()
            .enumerate()
            .find(|(_, cells)| cells.len() != num_nodes)
        {
            return Err(Error::InvalidModel(format!(
                "row {row} has {} cells, expected {num_nodes}",
                cells.len()
            )));
        }
        Self::from_flat(num_nodes, matrix.into_iter().flatten().collect(), leafs, root)
    }

    /// Builds a model from a row-major cell array of `num_nodes²` cells.
    pub fn from_flat(
        num_nodes: usize,
        cells: Vec<u16>,
        leafs: Vec<CoreId>,
        root: CoreId,
    ) -> Result<Self> {
        if num_nodes == 0 {
            return Err(Error::InvalidModel("model has no nodes".into()));
        }
        if cells.len() != num_nodes * num_nodes {
            return Err(Error::InvalidModel(format!(
                "{} cells do not form a {num_nodes}x{num_nodes} matrix",
                cells.len()
            )));
        }
        if root >= num_nodes {
            return Err(Error::InvalidModel(format!(
                "root {root} outside {num_nodes} nodes"
            )));
        }

        Ok(Self {
            num_nodes,
            cells,
            leafs,
            root,
        })
    }

    /// The binary-tree model over `num_nodes` nodes: children of `i` are
    /// `2i+1` (order 1) and `2i+2` (order 2).
    pub fn binary(num_nodes: usize) -> Result<Self> {
        if num_nodes == 0 {
            return Err(Error::InvalidModel("model has no nodes".into()));
        }

        let mut cells = vec![0u16; num_nodes * num_nodes];
        for child in 1..num_nodes {
            let parent = (child - 1) / 2;
            let order = if child % 2 == 1 { 1 } else { 2 };
            cells[parent * num_nodes + child] = EdgeKind::Child(order).encode();
            cells[child * num_nodes + parent] = EdgeKind::Parent.encode();
        }
        let leafs = (0..num_nodes).filter(|i| 2 * i + 1 >= num_nodes).collect();

        Self::from_flat(num_nodes, cells, leafs, 0)
    }

    /// Parses `{"model": [[..]] | [..], "leafs": [..], "root": n, "len": n}`.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawModel = serde_json::from_str(json)?;
        match raw.model {
            RawMatrix::Nested(rows) => {
                if let Some(len) = raw.len.filter(|&len| len != rows.len()) {
                    return Err(Error::InvalidModel(format!(
                        "len {len} does not match {} rows",
                        rows.len()
                    )));
                }
                Self::new(rows, raw.leafs, raw.root)
            }
            RawMatrix::Flat(cells) => {
                let len = raw
                    .len
                    .or_else(|| exact_sqrt(cells.len()))
                    .ok_or_else(|| {
                        Error::InvalidModel(format!("{} cells are not a square", cells.len()))
                    })?;
                Self::from_flat(len, cells, raw.leafs, raw.root)
            }
        }
    }

    /// Reads a JSON model file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let model = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), nodes = model.num_nodes, "model loaded");
        Ok(model)
    }

    /// Number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// The declared root.
    pub fn root(&self) -> CoreId {
        self.root
    }

    /// The declared leaf list, possibly zero-padded.
    pub fn leafs(&self) -> &[CoreId] {
        &self.leafs
    }

    /// Raw cell `[x][y]`; 0 outside the matrix.
    pub fn cell(&self, x: CoreId, y: CoreId) -> u16 {
        if x < self.num_nodes && y < self.num_nodes {
            self.cells[x * self.num_nodes + y]
        } else {
            0
        }
    }

    /// Raw row `x`.
    pub fn row(&self, x: CoreId) -> &[u16] {
        let start = x.min(self.num_nodes) * self.num_nodes;
        let end = (start + self.num_nodes).min(self.cells.len());
        &self.cells[start..end]
    }

    /// Decoded edges of row `x`, in column order.
    pub fn edges(&self, x: CoreId) -> impl Iterator<Item = Result<(CoreId, EdgeKind)>> + '_ {
        self.row(x)
            .iter()
            .enumerate()
            .filter_map(|(y, &value)| {
                EdgeKind::decode(value)
                    .map(|kind| kind.map(|k| (y, k)))
                    .transpose()
            })
    }

    /// Highest cluster id any cell refers to, plus one.
    pub fn num_clusters(&self) -> usize {
        self.cells
            .iter()
            .filter_map(|&v| match EdgeKind::decode(v) {
                Ok(Some(EdgeKind::ShmMember(c))) | Ok(Some(EdgeKind::ShmCoordinator(c))) => {
                    Some(c + 1)
                }
                _ => None,
            })
            .max()
            .unwrap_or(0)
            .min(MAX_CLUSTERS)
    }
}

fn exact_sqrt(n: usize) -> Option<usize> {
    let root = (n as f64).sqrt().round() as usize;
    (root * root == n).then_some(root)
}
