//! A per-process allowlist of filesystem paths.
//!
//! Before the first grant the filesystem is unrestricted. Afterwards every
//! path resolves to the grant of its longest unveiled prefix and paths
//! without such a prefix are invisible.

use core::fmt::{self, Display};

use alloc::{collections::BTreeMap, vec::Vec};
use bitflags::bitflags;
use log::debug;

use crate::{
    error::{Result, bail, ensure},
    fs::path::{FileName, Path},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnveilAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const BROWSE = 1 << 3;
        const EXECUTE = 1 << 4;
    }
}

const LETTERS: [(u8, UnveilAccess); 5] = [
    (b'r', UnveilAccess::READ),
    (b'w', UnveilAccess::WRITE),
    (b'c', UnveilAccess::CREATE),
    (b'b', UnveilAccess::BROWSE),
    (b'x', UnveilAccess::EXECUTE),
];

impl UnveilAccess {
    /// Parse a permission string like `"rwc"`. The empty string revokes
    /// access.
    pub fn parse(permissions: &[u8]) -> Result<Self> {
        let mut access = Self::empty();
        for c in permissions {
            let Some((_, bit)) = LETTERS.iter().find(|(letter, _)| letter == c) else {
                bail!(Inval);
            };
            access |= *bit;
        }
        Ok(access)
    }
}

impl Display for UnveilAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (letter, bit) in LETTERS {
            if self.contains(bit) {
                write!(f, "{}", char::from(letter))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VeilState {
    /// Nothing was unveiled.
    #[default]
    None,
    /// Some paths were unveiled and more may follow.
    Dropped,
    /// The veil can no longer be changed by this program.
    Locked,
    /// Like `Locked`, but the veil also survives execution of a new program.
    LockedInherited,
}

impl VeilState {
    pub fn is_locked(self) -> bool {
        matches!(self, Self::Locked | Self::LockedInherited)
    }
}

impl Display for VeilState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VeilState::None => "none",
            VeilState::Dropped => "dropped",
            VeilState::Locked => "locked",
            VeilState::LockedInherited => "locked (inherited)",
        };
        f.pad(name)
    }
}

/// Selects the veil a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnveilTarget {
    Current,
    AfterExec,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct UnveilNode {
    grant: Option<UnveilAccess>,
    children: BTreeMap<FileName, UnveilNode>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnveilData {
    state: VeilState,
    root: UnveilNode,
}

impl UnveilData {
    pub const fn new() -> Self {
        Self {
            state: VeilState::None,
            root: UnveilNode {
                grant: None,
                children: BTreeMap::new(),
            },
        }
    }

    pub fn state(&self) -> VeilState {
        self.state
    }

    /// Grant `access` to `path` and everything below it.
    ///
    /// `path` must be canonical and absolute. A grant at a path that was
    /// already unveiled is merged with the existing one, except that an
    /// empty grant revokes all access.
    pub fn unveil(&mut self, path: &Path, access: UnveilAccess) -> Result<()> {
        ensure!(!self.state.is_locked(), Perm);
        ensure!(path.is_absolute(), Inval);

        let node = path.components().fold(&mut self.root, |node, name| {
            node.children.entry(name.clone()).or_default()
        });
        let grant = match node.grant {
            Some(existing) if !access.is_empty() => existing | access,
            _ => access,
        };
        node.grant = Some(grant);

        if self.state == VeilState::None {
            self.state = VeilState::Dropped;
        }
        Ok(())
    }

    /// Freeze the veil for the rest of the program's lifetime.
    pub fn lock(&mut self) -> Result<()> {
        ensure!(!self.state.is_locked(), Perm);
        self.state = VeilState::Locked;
        Ok(())
    }

    /// Returns the access granted to `path`, or `None` if it's hidden.
    pub fn lookup(&self, path: &Path) -> Option<UnveilAccess> {
        if self.state == VeilState::None {
            return Some(UnveilAccess::all());
        }

        let mut node = &self.root;
        let mut access = node.grant;
        for name in path.components() {
            let Some(child) = node.children.get(name) else {
                break;
            };
            node = child;
            access = node.grant.or(access);
        }
        access
    }

    /// Succeeds if `path` was granted at least `required`.
    pub fn check(&self, path: &Path, required: UnveilAccess) -> Result<()> {
        let access = self.lookup(path).unwrap_or(UnveilAccess::empty());
        if !access.contains(required) {
            debug!("access to {path} denied by veil: need {required}, have {access}");
            bail!(Perm);
        }
        Ok(())
    }

    /// All explicit grants ordered by path.
    pub fn entries(&self) -> Vec<(Path, UnveilAccess)> {
        fn visit(node: &UnveilNode, path: &Path, entries: &mut Vec<(Path, UnveilAccess)>) {
            if let Some(access) = node.grant {
                entries.push((path.clone(), access));
            }
            for (name, child) in node.children.iter() {
                visit(child, &path.join(name), entries);
            }
        }

        let mut entries = Vec::new();
        visit(&self.root, &Path::root(), &mut entries);
        entries
    }

    /// Replace `current` with the veil prepared for the next program.
    ///
    /// An inherited lock keeps the current veil. Otherwise the prepared veil
    /// takes over and its lock, if any, becomes inherited.
    pub fn exec(current: &mut Self, after_exec: &mut Self) {
        if current.state == VeilState::LockedInherited {
            return;
        }

        let mut next = core::mem::take(after_exec);
        if next.state == VeilState::Locked {
            next.state = VeilState::LockedInherited;
        }
        *current = next;
    }
}

#[cfg(test)]
mod tests {
    use std::string::ToString;

    use super::{UnveilAccess, UnveilData, VeilState};
    use crate::{error::ErrorKind, fs::path::Path};

    fn path(path: &str) -> Path {
        Path::new(path.as_bytes()).unwrap()
    }

    #[test]
    fn untouched_veil_is_unrestricted() {
        let data = UnveilData::new();
        assert_eq!(data.lookup(&path("/anything")), Some(UnveilAccess::all()));
        assert!(data.check(&path("/x"), UnveilAccess::WRITE).is_ok());
    }

    #[test]
    fn longest_prefix_wins() {
        let mut data = UnveilData::new();
        data.unveil(&path("/a"), UnveilAccess::READ).unwrap();
        data.unveil(&path("/a/b"), UnveilAccess::WRITE).unwrap();

        assert_eq!(data.lookup(&path("/a/b/c")), Some(UnveilAccess::WRITE));
        assert_eq!(data.lookup(&path("/a/other")), Some(UnveilAccess::READ));
        assert_eq!(data.lookup(&path("/x")), None);
        assert_eq!(
            data.check(&path("/x"), UnveilAccess::empty()).unwrap_err(),
            ErrorKind::Perm
        );
    }

    #[test]
    fn grants_at_the_same_path_are_merged() {
        let mut data = UnveilData::new();
        data.unveil(&path("/tmp"), UnveilAccess::READ).unwrap();
        data.unveil(&path("/tmp"), UnveilAccess::WRITE | UnveilAccess::CREATE)
            .unwrap();
        assert_eq!(
            data.lookup(&path("/tmp/file")).unwrap().to_string(),
            "rwc"
        );

        data.unveil(&path("/tmp"), UnveilAccess::empty()).unwrap();
        assert_eq!(data.lookup(&path("/tmp/file")), Some(UnveilAccess::empty()));
    }

    #[test]
    fn locked_veil_is_frozen() {
        let mut data = UnveilData::new();
        data.unveil(&path("/etc"), UnveilAccess::READ).unwrap();
        assert_eq!(data.state(), VeilState::Dropped);
        data.lock().unwrap();

        let before = data.clone();
        assert_eq!(
            data.unveil(&path("/bin"), UnveilAccess::EXECUTE).unwrap_err(),
            ErrorKind::Perm
        );
        assert_eq!(data.lock().unwrap_err(), ErrorKind::Perm);
        assert_eq!(data, before);
    }

    #[test]
    fn revoked_file_inside_unveiled_directory() {
        let mut data = UnveilData::new();
        data.unveil(&path("/etc"), UnveilAccess::parse(b"r").unwrap())
            .unwrap();
        data.unveil(&path("/etc/passwd"), UnveilAccess::parse(b"").unwrap())
            .unwrap();
        data.lock().unwrap();

        assert_eq!(
            data.check(&path("/etc/passwd"), UnveilAccess::READ)
                .unwrap_err(),
            ErrorKind::Perm
        );
        assert!(data.check(&path("/etc/hosts"), UnveilAccess::READ).is_ok());
    }

    #[test]
    fn exec_swaps_in_the_prepared_veil() {
        let mut current = UnveilData::new();
        current.unveil(&path("/home"), UnveilAccess::READ).unwrap();
        let mut after_exec = UnveilData::new();
        after_exec.unveil(&path("/bin"), UnveilAccess::EXECUTE).unwrap();
        after_exec.lock().unwrap();

        UnveilData::exec(&mut current, &mut after_exec);
        assert_eq!(current.state(), VeilState::LockedInherited);
        assert_eq!(current.lookup(&path("/home")), None);
        assert_eq!(after_exec, UnveilData::new());

        // An inherited veil survives another exec.
        after_exec.unveil(&path("/home"), UnveilAccess::all()).unwrap();
        UnveilData::exec(&mut current, &mut after_exec);
        assert_eq!(current.lookup(&path("/bin/sh")), Some(UnveilAccess::EXECUTE));
        assert_eq!(current.lookup(&path("/home")), None);
    }

    #[test]
    fn exec_without_prepared_veil_lifts_the_veil() {
        let mut current = UnveilData::new();
        current.unveil(&path("/home"), UnveilAccess::READ).unwrap();
        current.lock().unwrap();

        UnveilData::exec(&mut current, &mut UnveilData::new());
        assert_eq!(current.state(), VeilState::None);
    }

    #[test]
    fn entries_are_listed_in_path_order() {
        let mut data = UnveilData::new();
        data.unveil(&path("/usr/lib"), UnveilAccess::READ).unwrap();
        data.unveil(&path("/etc"), UnveilAccess::READ).unwrap();
        data.unveil(&path("/usr"), UnveilAccess::BROWSE).unwrap();

        let entries = data
            .entries()
            .into_iter()
            .map(|(path, access)| (path.to_string(), access.to_string()))
            .collect::<std::vec::Vec<_>>();
        assert_eq!(
            entries,
            [
                ("/etc".to_string(), "r".to_string()),
                ("/usr".to_string(), "b".to_string()),
                ("/usr/lib".to_string(), "r".to_string()),
            ]
        );
    }
}
