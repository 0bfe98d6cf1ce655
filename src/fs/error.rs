//! 致命错误
//!
//! 缓存层中的所有错误都是不可恢复的: 违反调用约定 (未持锁写回, 释放未持有的缓冲区)
//! 或者资源/一致性被破坏 (缓存池耗尽, 预载块缺失, 镜像计数不一致).
//! 继续执行只会把损坏或缺失的数据交给上层, 所以统一走 [`fatal`] 终止当前线程.

use std::fmt::{self, Display, Formatter};

use log::error;

/// 被破坏的不变式, 带上出问题的设备号与块号, 方便事后定位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// 普通缓存中没有引用计数为 0 的缓冲区可供回收
    PoolExhausted { dev: u32, blockno: u32 },
    /// 通过未持锁的缓冲区写回
    WriteUnlocked { dev: u32, blockno: u32 },
    /// 释放一个调用者并不持有的缓冲区
    ReleaseNotHeld { dev: u32, blockno: u32 },
    /// unpin 次数多于 pin
    UnpinUnderflow { dev: u32, blockno: u32 },
    /// 被分类为预载的块在预载区中找不到
    PreloadMiss { dev: u32, blockno: u32 },
    /// 初始化之后绕过分类, 从普通缓存读取一个预载块
    PreloadBypass { dev: u32, blockno: u32 },
    /// 预载区尚未初始化就被查询
    PreloadNotReady { dev: u32, blockno: u32 },
    /// 位图中置位的块数与超级块声明的不一致
    PreloadCountMismatch { declared: u32, found: u32 },
    /// 位图置位的块落在可预载区间之外
    PreloadOutsideRegion { dev: u32, blockno: u32 },
    /// 页分配器无法提供预载区所需的连续页
    PreloadOutOfMemory { pages: usize },
    /// 超级块魔数不对
    BadMagic { dev: u32, magic: u32 },
    /// 超级块描述的布局自相矛盾
    BadGeometry { dev: u32, reason: &'static str },
    /// 设备号不在设备表中
    UnknownDevice { dev: u32 },
    /// 块设备读写失败
    DeviceIo { blockno: u32, write: bool },
}

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::PoolExhausted { dev, blockno } => {
                write!(f, "bget: no buffers for block {} on dev {}", blockno, dev)
            }
            Self::WriteUnlocked { dev, blockno } => {
                write!(f, "bwrite: block {} on dev {} is not locked by caller", blockno, dev)
            }
            Self::ReleaseNotHeld { dev, blockno } => {
                write!(f, "brelse: block {} on dev {} is not held by caller", blockno, dev)
            }
            Self::UnpinUnderflow { dev, blockno } => {
                write!(f, "bunpin: block {} on dev {} is not pinned", blockno, dev)
            }
            Self::PreloadMiss { dev, blockno } => {
                write!(f, "preload: block {} on dev {} is not resident", blockno, dev)
            }
            Self::PreloadBypass { dev, blockno } => write!(
                f,
                "bread: block {} on dev {} is preloaded, ordinary access refused",
                blockno, dev
            ),
            Self::PreloadNotReady { dev, blockno } => write!(
                f,
                "preload: lookup of block {} on dev {} before bootstrap",
                blockno, dev
            ),
            Self::PreloadCountMismatch { declared, found } => write!(
                f,
                "preload: superblock declares {} blocks, bitmap marks {}",
                declared, found
            ),
            Self::PreloadOutsideRegion { dev, blockno } => write!(
                f,
                "preload: marked block {} on dev {} is outside the preload region",
                blockno, dev
            ),
            Self::PreloadOutOfMemory { pages } => {
                write!(f, "preload: cannot allocate {} contiguous pages", pages)
            }
            Self::BadMagic { dev, magic } => {
                write!(f, "superblock: bad magic {:#x} on dev {}", magic, dev)
            }
            Self::BadGeometry { dev, reason } => {
                write!(f, "superblock: bad geometry on dev {}: {}", dev, reason)
            }
            Self::UnknownDevice { dev } => write!(f, "no block device with id {}", dev),
            Self::DeviceIo { blockno, write } => write!(
                f,
                "disk: {} of block {} failed",
                if write { "write" } else { "read" },
                blockno
            ),
        }
    }
}

/// 以 `violation` 为原因终止当前线程
#[cold]
pub fn fatal(violation: Violation) -> ! {
    error!("{}", violation);
    panic!("{}", violation)
}
