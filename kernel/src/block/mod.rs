//! Layered block I/O: storage backends, the buffer cache, and GPT
//! partition discovery.
//!
//! I/O from the filesystems flows `bio` → `storage` → (AHCI | IDE | RAM
//! disk). The kernel owns one global [`bio::BlockIo`] built at boot; tests
//! build private instances over RAM disks.

pub mod bio;
pub mod gpt;
pub mod storage;

use alloc::sync::Arc;

use spin::Once;

static BIO: Once<Arc<bio::BlockIo>> = Once::new();

/// Install the kernel's global block layer.
pub fn init() -> Arc<bio::BlockIo> {
    BIO.call_once(|| bio::BlockIo::new()).clone()
}

/// The global block layer. Panics before [`init`].
pub fn bio() -> Arc<bio::BlockIo> {
    BIO.get().expect("block layer not initialized").clone()
}
