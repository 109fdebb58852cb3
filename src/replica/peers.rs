use crate::network::{MemberId, MembershipInfo, MembershipCause, VirtualSynchronySet};

/// This replica's picture of the group, replaced on every membership event.
#[derive(Clone, Debug, Default)]
pub struct MembershipView {
    pub members: Vec<MemberId>,
    pub view_id: u64,
    /// Sets reported by the last network-caused view. Diagnostics only.
    pub partitions: Vec<VirtualSynchronySet>,
}

impl MembershipView {
    pub fn update(&mut self, info: &MembershipInfo) {
        self.members = info.members.clone();
        self.view_id = info.view_id;
        if let MembershipCause::Network(sets) = &info.cause {
            self.partitions = sets.clone();
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }
}
