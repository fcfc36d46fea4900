//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Sequences with a compile-time upper bound on their length.
//!
//! Every list in a descriptor has a fixed ceiling in the loader ABI. Holding
//! the ceiling in the type means that a descriptor that exists can always be
//! encoded, and the decoder can refuse an oversized count before it reads any
//! payload.

use serde::Serialize;
use std::ops::Deref;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("capacity of {capacity} entries exceeded")]
pub struct CapacityError {
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BoundedVec<T, const N: usize> {
    items: Vec<T>,
}

impl<T, const N: usize> BoundedVec<T, N> {
    pub fn new() -> Self {
        BoundedVec { items: Vec::new() }
    }

    pub fn from_vec(items: Vec<T>) -> Result<Self, CapacityError> {
        if items.len() > N {
            return Err(CapacityError { capacity: N });
        }
        Ok(BoundedVec { items })
    }

    pub fn push(&mut self, item: T) -> Result<(), CapacityError> {
        if self.items.len() == N {
            return Err(CapacityError { capacity: N });
        }
        self.items.push(item);
        Ok(())
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Mutable access to the stored entries. The length cannot change through
    /// this view.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.items
    }
}

impl<T, const N: usize> Default for BoundedVec<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Deref for BoundedVec<T, N> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T, const N: usize> TryFrom<Vec<T>> for BoundedVec<T, N> {
    type Error = CapacityError;

    fn try_from(items: Vec<T>) -> Result<Self, CapacityError> {
        BoundedVec::from_vec(items)
    }
}

impl<'a, T, const N: usize> IntoIterator for &'a BoundedVec<T, N> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T, const N: usize> IntoIterator for BoundedVec<T, N> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_stops_at_capacity() {
        let mut v: BoundedVec<u32, 2> = BoundedVec::new();
        v.push(1).unwrap();
        v.push(2).unwrap();
        assert_eq!(v.push(3), Err(CapacityError { capacity: 2 }));
        assert_eq!(v.as_slice(), &[1, 2]);
    }

    #[test]
    fn from_vec_rejects_oversized() {
        assert!(BoundedVec::<u8, 3>::from_vec(vec![0; 3]).is_ok());
        assert_eq!(
            BoundedVec::<u8, 3>::try_from(vec![0; 4]),
            Err(CapacityError { capacity: 3 })
        );
    }

    #[test]
    fn serializes_as_plain_list() {
        let v: BoundedVec<u8, 4> = BoundedVec::from_vec(vec![1, 2]).unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "[1,2]");
    }
}
