//! 磁盘数据结构层的代码在 layout.rs 和 bitmap.rs 中
//!
//! 预载位图由若干个块组成, 每个块大小为 512 bytes, 即 4096 bits.
//! 第 i 个位图块的第 j 个 bit 描述磁盘上编号为 i * 4096 + j 的块:
//! 1 表示该块是用户程序块, 挂载时被载入预载区并常驻内存, 0 表示走普通缓存.
//!
//! 位图在构建镜像时写好, 缓存层运行时只读不写.
//! 读位图总是走普通缓存 ([`Bcache::bread_ordinary`]), 不会再去分类位图块本身.

use std::ops::Range;

use super::{Bcache, SuperBlock, BLOCK_BITS, BLOCK_SIZE};

/// 位图区域中的一个磁盘块被解释为 u64 数组, 每个 u64 打包一组 64 bits
pub(super) type BitmapBlock = [u64; BLOCK_SIZE / 8]; // size = 64 * 64 = 4096 bits = 512 bytes

pub struct Bitmap {
    /// 位图所在区域的起始块编号
    start_block_id: u32,
    /// 位图使用的磁盘块数
    blocks_counts: u32,
}

impl Bitmap {
    pub fn new(start_block_id: u32, blocks_counts: u32) -> Self {
        Self {
            start_block_id,
            blocks_counts,
        }
    }

    /// 超级块描述的预载位图
    pub fn of(sb: &SuperBlock) -> Self {
        Self::new(sb.preload_bitmap_start, sb.preload_bitmap_blocks)
    }

    pub fn blocks_counts(&self) -> u32 {
        self.blocks_counts
    }

    /// 读出 blockno 对应的 bit.
    ///
    /// 位图块经普通缓存读入, 测试完立即释放, 不会和调用者随后要获取的块同时持有.
    pub fn test(&self, bcache: &Bcache, dev: u32, blockno: u32) -> bool {
        let (block_id, bits64_pos, inner_pos) = decomposition(blockno as usize);
        if block_id >= self.blocks_counts as usize {
            return false;
        }
        let buf = bcache.bread_ordinary(dev, self.start_block_id + block_id as u32);
        let bit = buf.data().read(0, |bitmap_block: &BitmapBlock| {
            bitmap_block[bits64_pos] & (1u64 << inner_pos) != 0
        });
        bit
    }

    /// 拷贝出区域内第 block_id 个位图块
    pub(super) fn load(&self, bcache: &Bcache, dev: u32, block_id: u32) -> BitmapBlock {
        let buf = bcache.bread_ordinary(dev, self.start_block_id + block_id);
        let bitmap_block = *buf.data().get_ref::<BitmapBlock>(0);
        bitmap_block
    }

    /// 把 blockno 对应的 bit 置 1 并写回, 返回该 bit 之前是否为 0.
    /// 只在构建镜像时使用.
    pub fn set(&self, bcache: &Bcache, dev: u32, blockno: u32) -> bool {
        let (block_id, bits64_pos, inner_pos) = decomposition(blockno as usize);
        assert!(block_id < self.blocks_counts as usize, "block {} beyond bitmap", blockno);
        let mut buf = bcache.bread(dev, self.start_block_id + block_id as u32);
        let fresh = buf
            .data_mut()
            .modify(0, |bitmap_block: &mut BitmapBlock| {
                let fresh = bitmap_block[bits64_pos] & (1u64 << inner_pos) == 0;
                bitmap_block[bits64_pos] |= 1u64 << inner_pos;
                fresh
            });
        if fresh {
            buf.bwrite();
        }
        fresh
    }

    /// 在 range 内找到第一个尚未置位的块, 置位并返回它的块号.
    ///
    /// 遍历区域中与 range 有交集的每个位图块, 在块内找到一个为 0 的 bit 并置 1,
    /// 一旦成功就不再考虑后续的块. 如果 range 内全部已置位, 则返回 None.
    pub fn alloc_in(&self, bcache: &Bcache, dev: u32, range: Range<u32>) -> Option<u32> {
        for block_id in 0..self.blocks_counts {
            // 这个位图块描述的第一个块号
            let first = block_id * BLOCK_BITS as u32;
            let lo = range.start.max(first);
            let hi = range.end.min(first + BLOCK_BITS as u32);
            if lo >= hi {
                continue;
            }
            let mut buf = bcache.bread(dev, self.start_block_id + block_id);
            let pos = buf
                .data_mut()
                .modify(0, |bitmap_block: &mut BitmapBlock| {
                    (lo - first..hi - first)
                        .map(|bit| decomposition(bit as usize))
                        .find(|&(_, bits64_pos, inner_pos)| {
                            bitmap_block[bits64_pos] & (1u64 << inner_pos) == 0
                        })
                        .map(|(_, bits64_pos, inner_pos)| {
                            bitmap_block[bits64_pos] |= 1u64 << inner_pos;
                            bits64_pos * 64 + inner_pos
                        })
                });
            if let Some(bit) = pos {
                buf.bwrite();
                return Some(first + bit as u32);
            }
        }
        None
    }
}

/// 位图块内所有置位的 bit 的编号, 从小到大
pub(super) fn set_bits(bitmap_block: &BitmapBlock) -> impl Iterator<Item = usize> + '_ {
    bitmap_block
        .iter()
        .enumerate()
        .filter(|(_, bits64)| **bits64 != 0)
        .flat_map(|(bits64_pos, &bits64)| {
            (0..64)
                .filter(move |inner_pos| bits64 & (1u64 << inner_pos) != 0)
                .map(move |inner_pos| bits64_pos * 64 + inner_pos)
        })
}

/// 将bit编号 bit 分解为区域中的块编号 block_pos , 块内的组编号 bits64_pos 以及组内编号 inner_pos 的三元组
fn decomposition(mut bit: usize) -> (usize, usize, usize) {
    let block_id = bit / BLOCK_BITS;
    bit %= BLOCK_BITS;
    (block_id, bit / 64, bit % 64)
}
