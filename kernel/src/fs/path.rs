use core::fmt::{self, Debug, Display};

use alloc::{borrow::ToOwned, vec::Vec};

use crate::error::{Result, ensure};

pub const PATH_MAX: usize = 4096;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileName(Vec<u8>);

impl FileName {
    pub fn new(name: &[u8]) -> Result<Self, ParseFileNameError> {
        match name {
            b"" => Err(ParseFileNameError::Empty),
            b"." => Err(ParseFileNameError::Dot),
            b".." => Err(ParseFileNameError::DotDot),
            name if name.contains(&b'/') => Err(ParseFileNameError::Slash),
            name => Ok(Self(name.to_owned())),
        }
    }
}

impl AsRef<[u8]> for FileName {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(str) = core::str::from_utf8(&self.0) {
            write!(f, "{str}")
        } else {
            self.0.fmt(f)
        }
    }
}

#[derive(Debug)]
pub enum ParseFileNameError {
    Empty,
    Dot,
    DotDot,
    Slash,
}

impl Display for ParseFileNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFileNameError::Empty => write!(f, "file name must not be empty"),
            ParseFileNameError::Dot => write!(f, "dot is not a valid file name"),
            ParseFileNameError::DotDot => write!(f, "dot dot is not a valid file name"),
            ParseFileNameError::Slash => write!(f, "file name must not contain a slash"),
        }
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone)]
enum PathSegment {
    Empty,
    Dot,
    DotDot,
    FileName(FileName),
}

/// A path as passed in by userspace.
#[derive(Clone, PartialEq, Eq)]
pub struct Path {
    is_absolute: bool,
    segments: Vec<PathSegment>,
}

impl Path {
    pub fn new(mut path: &[u8]) -> Result<Self> {
        ensure!(!path.is_empty(), NoEnt);
        ensure!(path.len() < PATH_MAX, NameTooLong);

        let mut is_absolute = false;
        if let Some((b'/', tail)) = path.split_first() {
            is_absolute = true;
            path = tail;
        }

        let mut this = Path {
            is_absolute,
            segments: Vec::new(),
        };
        if !path.is_empty() {
            for segment in path.split(|&c| c == b'/') {
                this.join_in_place(segment);
            }
        }
        Ok(this)
    }

    /// The path of the root directory.
    pub fn root() -> Self {
        Self {
            is_absolute: true,
            segments: Vec::new(),
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.is_absolute
    }

    pub fn is_root(&self) -> bool {
        self.is_absolute && self.segments.is_empty()
    }

    fn join_in_place(&mut self, segment: &[u8]) {
        let segment = match FileName::new(segment) {
            Ok(file_name) => PathSegment::FileName(file_name),
            Err(ParseFileNameError::Empty) => PathSegment::Empty,
            Err(ParseFileNameError::Dot) => PathSegment::Dot,
            Err(ParseFileNameError::DotDot) => PathSegment::DotDot,
            Err(ParseFileNameError::Slash) => unreachable!(),
        };
        self.segments.push(segment);
    }

    pub fn join(&self, name: &FileName) -> Self {
        let mut this = self.clone();
        this.segments.push(PathSegment::FileName(name.clone()));
        this
    }

    /// Remove empty and `.` segments and resolve `..` lexically.
    ///
    /// `..` at the root stays at the root.
    pub fn canonicalize(&mut self) {
        let mut idx = 0;
        while let Some(segment) = self.segments.get(idx) {
            match segment {
                PathSegment::Empty | PathSegment::Dot => {
                    self.segments.remove(idx);
                }
                PathSegment::DotDot => {
                    self.segments.remove(idx);
                    if let Some(new_idx) = idx.checked_sub(1) {
                        idx = new_idx;
                        self.segments.remove(idx);
                    }
                }
                PathSegment::FileName(_) => idx += 1,
            }
        }
    }

    /// Returns the canonical absolute form of this path, interpreting
    /// relative paths starting at `cwd`.
    pub fn absolute(&self, cwd: &Path) -> Self {
        let mut path = if self.is_absolute {
            self.clone()
        } else {
            let mut path = cwd.clone();
            path.is_absolute = true;
            path.segments.extend(self.segments.iter().cloned());
            path
        };
        path.canonicalize();
        path
    }

    /// The file names of a canonical path.
    pub fn components(&self) -> impl Iterator<Item = &FileName> {
        self.segments.iter().filter_map(|segment| match segment {
            PathSegment::FileName(file_name) => Some(file_name),
            _ => None,
        })
    }

    pub fn file_name(&self) -> Option<&FileName> {
        match self.segments.last()? {
            PathSegment::FileName(file_name) => Some(file_name),
            _ => None,
        }
    }

    /// Returns the canonical parent directory or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        let mut parent = self.clone();
        parent.canonicalize();
        parent.segments.pop()?;
        Some(parent)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        if self.is_absolute {
            bytes.push(b'/');
        }
        let mut segments = self.segments.iter();
        if let Some(segment) = segments.next() {
            bytes.extend_from_slice(segment.as_ref());
            for segment in segments {
                bytes.push(b'/');
                bytes.extend_from_slice(segment.as_ref());
            }
        }
        bytes
    }
}

impl AsRef<[u8]> for PathSegment {
    fn as_ref(&self) -> &[u8] {
        match self {
            PathSegment::Empty => b"",
            PathSegment::Dot => b".",
            PathSegment::DotDot => b"..",
            PathSegment::FileName(filename) => filename.as_ref(),
        }
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        match core::str::from_utf8(&bytes) {
            Ok(str) => f.pad(str),
            Err(_) => write!(f, "{bytes:?}"),
        }
    }
}

impl Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
