//! 磁盘数据结构层的代码在 layout.rs 和 bitmap.rs 中
//!
//! 磁盘按照块编号从小到大分成几个区域:
//!
//! - 块 0 是超级块 ([`SuperBlock`]), 以魔数的形式提供合法性检查, 同时记录其他区域的位置
//! - 预载位图区域, 长度为若干个块, 每个 bit 对应磁盘上的一个块 (从块 0 开始编号),
//!   置 1 表示该块是用户程序块, 挂载后常驻内存
//! - 可预载区域 `[preload_start, preload_end)`, 只有这个区间里的块才可能被标记
//! - 其余的数据块, 走普通缓存
//!
//! 位图区域和超级块必须在可预载区域之外, 否则查询位图本身时又要去查位图.

use std::fmt::{Debug, Formatter, Result};

use super::{BCACHE_MAGIC, BLOCK_BITS, SUPER_BLOCK_ID};

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    magic: u32, // 用于合法性验证的魔数
    pub total_blocks: u32,
    /// 可预载区域的第一个块
    pub preload_start: u32,
    /// 可预载区域之后的第一个块
    pub preload_end: u32,
    pub preload_bitmap_start: u32,
    pub preload_bitmap_blocks: u32,
    /// 位图中置位的块数, 也就是预载区的大小
    pub preload_count: u32,
}

impl Debug for SuperBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("SuperBlock")
            .field("magic", &self.magic)
            .field("total_blocks", &self.total_blocks)
            .field("preload_start", &self.preload_start)
            .field("preload_end", &self.preload_end)
            .field("preload_bitmap_start", &self.preload_bitmap_start)
            .field("preload_bitmap_blocks", &self.preload_bitmap_blocks)
            .field("preload_count", &self.preload_count)
            .finish()
    }
}

/// SuperBlock 是一个磁盘上数据结构, 它就存放在磁盘上编号为 0 的块的起始处
impl SuperBlock {
    /// 格式化磁盘时创建超级块, 各区域的位置由镜像构建者计算好后传进来.
    /// 刚创建时没有任何块被标记.
    pub fn new(
        total_blocks: u32,
        preload_start: u32,
        preload_end: u32,
        preload_bitmap_start: u32,
    ) -> Self {
        Self {
            magic: BCACHE_MAGIC,
            total_blocks,
            preload_start,
            preload_end,
            preload_bitmap_start,
            preload_bitmap_blocks: Self::bitmap_blocks_for(total_blocks),
            preload_count: 0,
        }
    }

    /// 描述 total_blocks 个块所需的位图块数
    pub fn bitmap_blocks_for(total_blocks: u32) -> u32 {
        ((total_blocks as usize + BLOCK_BITS - 1) / BLOCK_BITS) as u32
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// is_valid 可以通过魔数判断超级块所在的镜像是否合法
    pub fn is_valid(&self) -> bool {
        self.magic == BCACHE_MAGIC
    }

    /// blockno 是否落在可预载区域
    pub fn is_preloadable(&self, blockno: u32) -> bool {
        (self.preload_start..self.preload_end).contains(&blockno)
    }

    /// 检查区域划分, 返回第一个不成立的条件
    pub fn check_geometry(&self) -> Option<&'static str> {
        let bitmap_end = self.preload_bitmap_start as u64 + self.preload_bitmap_blocks as u64;
        if self.preload_start > self.preload_end {
            Some("preload region ends before it starts")
        } else if self.preload_end > self.total_blocks {
            Some("preload region exceeds the disk")
        } else if bitmap_end > self.total_blocks as u64 {
            Some("preload bitmap exceeds the disk")
        } else if self.preload_bitmap_blocks < Self::bitmap_blocks_for(self.total_blocks) {
            Some("preload bitmap too small for the disk")
        } else if self.preload_bitmap_start == SUPER_BLOCK_ID {
            Some("preload bitmap overlaps the superblock")
        } else if self.is_preloadable(SUPER_BLOCK_ID) {
            Some("superblock inside the preload region")
        } else if (self.preload_bitmap_start as u64) < self.preload_end as u64
            && bitmap_end > self.preload_start as u64
            && self.preload_start < self.preload_end
        {
            Some("preload bitmap overlaps the preload region")
        } else if self.preload_count > self.preload_end - self.preload_start {
            Some("more preloaded blocks than the region holds")
        } else {
            None
        }
    }
}
