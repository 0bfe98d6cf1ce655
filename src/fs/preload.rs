//! 预载区: 用户程序块常驻内存
//!
//! 预载位图中置位的块在挂载时被一次性读入一段连续的内存 ([`PreloadStore::bootstrap`]),
//! 之后对这些块的访问都不再经过普通缓存, 也就不会被 LRU 换出.
//!
//! 预载区与普通缓存的区别:
//!
//! - 槽位与块号的对应关系在初始化后固定, 不做引用计数也不调整顺序
//! - 查找是线性扫描, 找不到说明镜像损坏或初始化有误, 直接终止
//! - 释放只是解锁, 槽位永远不会被挪给别的块
//!
//! 槽位映射初始化后只读, 读它不需要加锁; 每个槽位自己的睡眠锁串行化对块内容的访问.

use std::mem::size_of;

use log::{debug, info};

use super::{
    bitmap::{set_bits, Bitmap},
    fatal, Bcache, BufData, PageAllocator, SleepLock, SuperBlock, Violation, BLOCK_BITS,
    PAGE_SIZE,
};

/// 预载区中的一个槽位
pub(super) struct PreloadSlot {
    pub(super) dev: u32,
    pub(super) blockno: u32,
    pub(super) data: SleepLock<BufData>,
}

pub struct PreloadStore {
    dev: u32,
    sb: SuperBlock,
    slots: Vec<PreloadSlot>,
}

/// 容纳 count 个槽位所需的页数
pub fn pages_for(count: usize) -> usize {
    (count * size_of::<PreloadSlot>() + PAGE_SIZE - 1) / PAGE_SIZE
}

impl PreloadStore {
    /// 扫描设备 dev 上的预载位图, 把每个置位的块经普通缓存读入并拷贝进预载区.
    ///
    /// 槽位按块号从小到大排列. 扫描结束后置位块数必须与超级块声明的一致,
    /// 否则镜像不一致, 在任何分类查询依赖预载区之前终止.
    pub(super) fn bootstrap(
        bcache: &Bcache,
        dev: u32,
        sb: &SuperBlock,
        allocator: &dyn PageAllocator,
    ) -> Self {
        let declared = sb.preload_count as usize;

        // 一次申请足够容纳全部槽位的连续页, 分配器只扣额度, 槽位放在 slots 里
        let pages = pages_for(declared);
        if !allocator.alloc_pages(pages) {
            fatal(Violation::PreloadOutOfMemory { pages });
        }
        let mut slots = Vec::with_capacity(declared);

        let bitmap = Bitmap::of(sb);
        let mut found = 0usize;
        for block_id in 0..bitmap.blocks_counts() {
            // 先把位图块拷贝出来并释放, 读数据块时不再持有它
            let bitmap_block = bitmap.load(bcache, dev, block_id);
            for bit in set_bits(&bitmap_block) {
                let blockno = (block_id as usize * BLOCK_BITS + bit) as u32;
                if !sb.is_preloadable(blockno) {
                    fatal(Violation::PreloadOutsideRegion { dev, blockno });
                }
                found += 1;
                // 多出来的置位只计数, 最后统一报告
                if found > declared {
                    continue;
                }
                let buf = bcache.bread_ordinary(dev, blockno);
                let mut data = BufData::new();
                data.as_bytes_mut().copy_from_slice(buf.data().as_bytes());
                drop(buf);
                // 普通缓存里不能留下第二份
                bcache.forget(dev, blockno);
                debug!("preload: slot {} <- block {} on dev {}", slots.len(), blockno, dev);
                slots.push(PreloadSlot {
                    dev,
                    blockno,
                    data: SleepLock::new(data),
                });
            }
        }

        if found != declared {
            fatal(Violation::PreloadCountMismatch {
                declared: sb.preload_count,
                found: found as u32,
            });
        }
        info!(
            "preload: {} blocks of dev {} resident in {} pages",
            slots.len(),
            dev,
            pages
        );
        Self {
            dev,
            sb: *sb,
            slots,
        }
    }

    /// 线性扫描查找 (dev, blockno) 所在的槽位
    pub(super) fn lookup(&self, dev: u32, blockno: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.dev == dev && slot.blockno == blockno)
    }

    pub(super) fn slot(&self, index: usize) -> &PreloadSlot {
        &self.slots[index]
    }

    /// 预载区所属的设备
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// 挂载时读到的超级块
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 常驻的块号, 从小到大
    pub fn blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().map(|slot| slot.blockno)
    }
}
