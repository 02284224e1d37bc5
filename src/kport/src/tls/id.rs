//! TLS ID allocator
use super::TlsId;
use crate::{
    klock::{CsCell, CsGuard},
    AllocIdError, Kernel,
};

/// Issues [`TlsId`]s in increasing order. IDs are never reclaimed.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: CsCell<u8>,
    limit: u8,
}

impl IdAllocator {
    pub(crate) const fn new(limit: usize) -> Self {
        assert!(limit <= crate::MAX_TLS_TABLE_SIZE);
        Self {
            next: CsCell::new(0),
            limit: limit as u8,
        }
    }

    pub(crate) fn allocate<K: Kernel>(
        &self,
        cs: &mut CsGuard<'_, K>,
    ) -> Result<TlsId, AllocIdError> {
        let next = self.next.write(cs);
        if *next >= self.limit {
            return Err(AllocIdError::Exhaustion);
        }
        let id = TlsId(*next);
        *next += 1;
        Ok(id)
    }

    /// Get the number of IDs issued so far.
    pub(crate) fn allocated<K: Kernel>(&self, cs: &CsGuard<'_, K>) -> usize {
        *self.next.read(cs) as usize
    }

    /// Check if `id` has been issued.
    #[inline]
    pub(crate) fn is_issued<K: Kernel>(&self, id: TlsId, cs: &CsGuard<'_, K>) -> bool {
        (id.0 as usize) < self.allocated(cs)
    }
}
