use core::ops::{Index, IndexMut};

use crate::error::{Error, Result, err};

/// An index into a table of `N` entries. The bound is checked once when the
/// index is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LimitedIndex<const N: usize>(u16);

impl<const N: usize> LimitedIndex<N> {
    pub const LAST: Self = Self::new(N - 1);

    #[track_caller]
    pub const fn new(idx: usize) -> Self {
        assert!(N <= u16::MAX as usize);
        assert!(idx < N, "index out of range");
        Self(idx as u16)
    }

    pub const fn get(self) -> usize {
        self.0 as usize
    }

    pub fn iter() -> impl ExactSizeIterator<Item = Self> {
        (0..N).map(Self::new)
    }
}

impl<const N: usize> TryFrom<usize> for LimitedIndex<N> {
    type Error = Error;

    fn try_from(idx: usize) -> Result<Self> {
        if idx < N {
            Ok(Self(idx as u16))
        } else {
            Err(err!(Inval))
        }
    }
}

impl<T, const N: usize> Index<LimitedIndex<N>> for [T; N] {
    type Output = T;

    fn index(&self, index: LimitedIndex<N>) -> &Self::Output {
        // SAFETY: The index was checked against `N` when it was created.
        unsafe { self.get_unchecked(index.get()) }
    }
}

impl<T, const N: usize> IndexMut<LimitedIndex<N>> for [T; N] {
    fn index_mut(&mut self, index: LimitedIndex<N>) -> &mut Self::Output {
        // SAFETY: The index was checked against `N` when it was created.
        unsafe { self.get_unchecked_mut(index.get()) }
    }
}
