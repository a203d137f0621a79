//! Group views as declared by the membership layer above GMCast.

use std::collections::BTreeSet;
use std::fmt;

use gmcast_core::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewType {
    /// Primary component view: the declared live member set is
    /// authoritative and GMCast prunes its address book against it.
    Prim,
    /// Non-primary view: informational only, ignored by GMCast.
    NonPrim,
}

/// A membership view: the set of nodes the layer above currently considers
/// group members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    view_type: ViewType,
    members: BTreeSet<NodeId>,
}

impl View {
    pub fn new(view_type: ViewType, members: BTreeSet<NodeId>) -> Self {
        Self { view_type, members }
    }

    pub fn is_prim(&self) -> bool {
        self.view_type == ViewType::Prim
    }

    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.view_type {
            ViewType::Prim => write!(f, "prim {{")?,
            ViewType::NonPrim => write!(f, "non-prim {{")?,
        }
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{member}")?;
        }
        write!(f, "}}")
    }
}
