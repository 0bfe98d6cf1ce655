mod bcache;
mod bitmap;
mod block_cache;
mod block_dev;
mod error;
mod image;
mod layout;
mod page_alloc;
mod preload;
mod sleeplock;

extern crate log;

/// Use a block size of 512 bytes
pub const BLOCK_SIZE: usize = 512;
/// 为了避免在块缓存上浪费过多内存, 普通缓存池中同时只能驻留有限个磁盘块的缓冲区
pub const BLOCK_CACHE_SIZE: usize = 30;
/// Magic number for sanity check
pub const BCACHE_MAGIC: u32 = 0x10203040;
/// 超级块所在的块号
pub const SUPER_BLOCK_ID: u32 = 0;
/// 块的 bit 数量, 即一个位图块能描述的块数
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;
/// 页分配器的页大小
pub const PAGE_SIZE: usize = 4096;

pub use bcache::{Bcache, Buf, PinnedBuf};
pub use bitmap::Bitmap;
pub use block_cache::BufData;
pub use block_dev::BlockDevice;
pub use error::{fatal, Violation};
pub use image::ImageBuilder;
pub use layout::SuperBlock;
pub use page_alloc::{PageAllocator, PagePool};
pub use preload::{pages_for, PreloadStore};
pub use sleeplock::{SleepLock, SleepLockGuard};
