use alloc::sync::Arc;

use bytemuck::{Pod, Zeroable};

/// An immutable snapshot of a process's identity. Changing an id replaces
/// the whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub real_user_id: Uid,
    pub real_group_id: Gid,
    pub effective_user_id: Uid,
    pub effective_group_id: Gid,
    pub saved_set_user_id: Uid,
    pub saved_set_group_id: Gid,
    pub supplementary_group_ids: Arc<[Gid]>,
}

impl Credentials {
    pub fn super_user() -> Self {
        Self::new(Uid::SUPER_USER, Gid::SUPER_USER)
    }

    pub fn new(uid: Uid, gid: Gid) -> Self {
        Self {
            real_user_id: uid,
            real_group_id: gid,
            effective_user_id: uid,
            effective_group_id: gid,
            saved_set_user_id: uid,
            saved_set_group_id: gid,
            supplementary_group_ids: Arc::new([]),
        }
    }

    pub fn is_super_user(&self) -> bool {
        self.effective_user_id == Uid::SUPER_USER
    }

    /// The credentials after executing a set-user-id and/or set-group-id
    /// program.
    pub fn with_executable_owner(&self, uid: Option<Uid>, gid: Option<Gid>) -> Self {
        let mut this = self.clone();
        if let Some(uid) = uid {
            this.effective_user_id = uid;
            this.saved_set_user_id = uid;
        }
        if let Some(gid) = gid {
            this.effective_group_id = gid;
            this.saved_set_group_id = gid;
        }
        this
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Uid(u32);

impl Uid {
    pub const SUPER_USER: Self = Self(0);

    pub const fn new(uid: u32) -> Self {
        Self(uid)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Gid(u32);

impl Gid {
    pub const SUPER_USER: Self = Self(0);

    pub const fn new(gid: u32) -> Self {
        Self(gid)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}
