//! Per-core transport roles.

use super::model::{EdgeKind, Model};
use crate::{CoreId, Result};

/// Which transports a core drives, derived from its model row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Roles {
    /// Has message-passing children
    pub mp_send: bool,
    /// Has a message-passing parent
    pub mp_recv: bool,
    /// Coordinates a shared-memory cluster
    pub shm_send: bool,
    /// Is a member of a shared-memory cluster
    pub shm_recv: bool,
}

impl Roles {
    /// Classifies `core` by scanning its row of `model`.
    pub fn classify(model: &Model, core: CoreId) -> Result<Self> {
        let mut roles = Self::default();
        for edge in model.edges(core) {
            match edge?.1 {
                EdgeKind::Child(_) => roles.mp_send = true,
                EdgeKind::Parent => roles.mp_recv = true,
                EdgeKind::ShmCoordinator(_) => roles.shm_send = true,
                EdgeKind::ShmMember(_) => roles.shm_recv = true,
            }
        }
        Ok(roles)
    }

    /// Uses a message-passing edge in either direction.
    pub fn uses_mp(&self) -> bool {
        self.mp_send || self.mp_recv
    }

    /// Uses a shared-memory cluster in either role.
    pub fn uses_shm(&self) -> bool {
        self.shm_send || self.shm_recv
    }

    /// Uses both transports.
    pub fn is_hybrid(&self) -> bool {
        self.uses_mp() && self.uses_shm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hybrid_model_roles() {
        let model = Model::new(
            vec![
                vec![0, 70, 70, 1],
                vec![50, 0, 0, 0],
                vec![50, 0, 0, 0],
                vec![99, 0, 0, 0],
            ],
            vec![1, 2, 3],
            0,
        )
        .unwrap();

        let root = Roles::classify(&model, 0).unwrap();
        assert!(root.mp_send && root.shm_send && !root.mp_recv && !root.shm_recv);
        assert!(root.is_hybrid());

        let member = Roles::classify(&model, 1).unwrap();
        assert_eq!(
            member,
            Roles {
                shm_recv: true,
                ..Roles::default()
            }
        );
        assert!(!member.uses_mp());

        let leaf = Roles::classify(&model, 3).unwrap();
        assert!(leaf.mp_recv && !leaf.mp_send && !leaf.uses_shm());
    }

    #[test]
    fn test_binary_interior_node() {
        let model = Model::binary(7).unwrap();
        let roles = Roles::classify(&model, 1).unwrap();
        assert!(roles.mp_send && roles.mp_recv && !roles.uses_shm());
    }
}
