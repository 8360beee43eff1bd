//! Fixed-block pools carved out of the shared region
//!
//! The pool table sits right after the region header. Each entry holds a spin
//! lock, the list of free blocks, the block size, and the number of free
//! blocks. Free blocks are linked through their first two words, so every
//! CPU can allocate and free through its own view of the region.
use r3_smobj::{
    addr::WORD_SIZE,
    list::{SharedList, LIST_SIZE, NODE_SIZE},
    port::{PortBus, PortTestAndSet, PortVisibility},
    smem::Shm,
    spinlock::SpinLock,
    GlobalAddr, Pool, HEADER_SIZE, PROXY_SIZE, SEMAPHORE_SIZE,
};

const ENTRY_LOCK: u32 = 0;
const ENTRY_FREE: u32 = 4;
const ENTRY_BLOCK_SIZE: u32 = ENTRY_FREE + LIST_SIZE;
const ENTRY_NUM_FREE: u32 = ENTRY_BLOCK_SIZE + 4;
const ENTRY_SIZE: u32 = ENTRY_NUM_FREE + 4;

const POOLS: [Pool; 2] = [Pool::Semaphore, Pool::Proxy];

/// The first offset past the pool table.
const TABLE_END: u32 = HEADER_SIZE + ENTRY_SIZE * POOLS.len() as u32;

const fn pool_index(pool: Pool) -> u32 {
    match pool {
        Pool::Semaphore => 0,
        Pool::Proxy => 1,
    }
}

const fn block_size(pool: Pool) -> u32 {
    let size = match pool {
        Pool::Semaphore => SEMAPHORE_SIZE,
        Pool::Proxy => PROXY_SIZE,
    };
    size.next_multiple_of(WORD_SIZE)
}

const _: () = assert!(block_size(Pool::Semaphore) >= NODE_SIZE && block_size(Pool::Proxy) >= NODE_SIZE);

/// Get the number of bytes needed to hold the pool table and the blocks.
pub(crate) const fn required_len(num_semaphores: u32, num_proxies: u32) -> u32 {
    TABLE_END
        + num_semaphores * block_size(Pool::Semaphore)
        + num_proxies * block_size(Pool::Proxy)
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolAllocator {
    spin_tries: u32,
}

impl PoolAllocator {
    pub(crate) const fn new(spin_tries: u32) -> Self {
        Self { spin_tries }
    }

    fn entry(pool: Pool) -> GlobalAddr {
        let offset = HEADER_SIZE + pool_index(pool) * ENTRY_SIZE;
        match GlobalAddr::new(offset) {
            Some(x) => x,
            None => unreachable!(),
        }
    }

    fn lock_of(pool: Pool) -> SpinLock {
        SpinLock::new(Self::entry(pool).field(ENTRY_LOCK))
    }

    fn free_list(pool: Pool) -> SharedList {
        SharedList::new(Self::entry(pool).field(ENTRY_FREE))
    }

    /// Lay out the pools. The region must be large enough (see
    /// [`required_len`]), and no other CPU may be using the region yet.
    pub(crate) fn format<P: PortBus + PortVisibility + ?Sized>(
        &self,
        shm: Shm<'_, P>,
        counts: [u32; 2],
    ) {
        let mut next = TABLE_END;
        for (pool, count) in POOLS.into_iter().zip(counts) {
            let entry = Self::entry(pool);
            let list = Self::free_list(pool);
            let size = block_size(pool);
            Self::lock_of(pool).init(shm);
            list.init(shm);
            shm.store(entry.field(ENTRY_BLOCK_SIZE), size);
            shm.store(entry.field(ENTRY_NUM_FREE), count);

            for _ in 0..count {
                let Some(block) = GlobalAddr::new(next) else {
                    unreachable!()
                };
                list.append(shm, block);
                next += size;
            }
            log::debug!(
                "{:?} pool: {} blocks of {} bytes",
                pool,
                count,
                size
            );
        }
        debug_assert!(next <= shm.map().len());
        shm.publish();
    }

    pub(crate) fn allocate<P: PortBus + PortVisibility + PortTestAndSet + ?Sized>(
        &self,
        shm: Shm<'_, P>,
        pool: Pool,
        size: u32,
    ) -> Option<GlobalAddr> {
        let entry = Self::entry(pool);
        let guard = Self::lock_of(pool).lock(shm, self.spin_tries).ok()?;
        let shm = guard.shm();

        if size > shm.load(entry.field(ENTRY_BLOCK_SIZE)) {
            log::error!("{:?} pool: can't allocate {} bytes", pool, size);
            return None;
        }

        let block = Self::free_list(pool).pop_front(shm)?;
        let num_free = shm.load(entry.field(ENTRY_NUM_FREE));
        shm.store(entry.field(ENTRY_NUM_FREE), num_free - 1);
        Some(block)
    }

    pub(crate) fn free<P: PortBus + PortVisibility + PortTestAndSet + ?Sized>(
        &self,
        shm: Shm<'_, P>,
        pool: Pool,
        block: GlobalAddr,
    ) {
        let entry = Self::entry(pool);
        let Ok(guard) = Self::lock_of(pool).lock(shm, self.spin_tries) else {
            log::error!("{:?} pool: leaking {:?}", pool, block);
            return;
        };
        let shm = guard.shm();
        Self::free_list(pool).append(shm, block);
        let num_free = shm.load(entry.field(ENTRY_NUM_FREE));
        shm.store(entry.field(ENTRY_NUM_FREE), num_free + 1);
    }

    pub(crate) fn num_free<P: PortBus + PortVisibility + PortTestAndSet + ?Sized>(
        &self,
        shm: Shm<'_, P>,
        pool: Pool,
    ) -> Option<u32> {
        let guard = Self::lock_of(pool).lock(shm, self.spin_tries).ok()?;
        Some(guard.shm().load(Self::entry(pool).field(ENTRY_NUM_FREE)))
    }
}
