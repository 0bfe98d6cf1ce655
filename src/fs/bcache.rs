//! 块缓存的对外接口
//!
//! 上层通过 [`Bcache::bread`] 拿到一个已上锁且内容有效的缓冲区 [`Buf`],
//! 直接读写其中的数据, 修改后调用 [`Buf::bwrite`] 写回磁盘, 用完后 drop (或 [`Buf::release`]) 释放.
//! 同一时刻只有一个线程能持有某个块的缓冲区, 所以不要长时间占着不放.
//!
//! 每次请求先分类: 挂载初始化 ([`Bcache::bootstrap`]) 完成之后,
//! 可预载区域内且预载位图置位的块由预载区提供, 其余的块走普通 LRU 缓存.
//! 初始化之前所有请求都走普通缓存.

use std::sync::{atomic::Ordering, Arc};

use log::{debug, trace, warn};
use spin::{Mutex, Once};

use super::{
    block_cache::{BufInner, BufLru},
    fatal, Bitmap, BlockDevice, BufData, PageAllocator, PreloadStore, SleepLockGuard,
    SuperBlock, Violation, SUPER_BLOCK_ID,
};

/// 块缓存, 在内核初始化时构造一次, 以引用的形式交给各个使用者
pub struct Bcache {
    /// 普通缓存的 LRU 链表与引用计数, 只在短暂的元数据操作中持有
    ctrl: Mutex<BufLru>,
    /// 普通缓存的缓冲区, 下标与 `ctrl` 中的控制信息一一对应
    bufs: Vec<BufInner>,
    /// 设备表, 设备号即下标
    devices: Vec<Arc<dyn BlockDevice>>,
    /// 预载区, 初始化完成后才可见
    preload: Once<PreloadStore>,
}

/// 缓冲区来自哪里, 决定了释放时做什么
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Ordinary(usize),
    Preloaded(usize),
}

impl Bcache {
    /// 创建一个有 nbuf 个缓冲区的块缓存, 设备号为 devices 中的下标
    pub fn new(nbuf: usize, devices: Vec<Arc<dyn BlockDevice>>) -> Self {
        Self {
            ctrl: Mutex::new(BufLru::new(nbuf)),
            bufs: (0..nbuf).map(|_| BufInner::new()).collect(),
            devices,
            preload: Once::new(),
        }
    }

    /// 普通缓存的容量
    pub fn capacity(&self) -> usize {
        self.bufs.len()
    }

    fn device(&self, dev: u32) -> &Arc<dyn BlockDevice> {
        self.devices
            .get(dev as usize)
            .unwrap_or_else(|| fatal(Violation::UnknownDevice { dev }))
    }

    /// 挂载设备 dev: 读超级块, 扫描预载位图并载入所有用户程序块.
    ///
    /// 只有这一步成功完成后, 分类查询才会把请求转给预载区.
    /// 每个缓存只初始化一次, 重复调用直接返回已有的预载区.
    pub fn bootstrap(&self, dev: u32, allocator: &dyn PageAllocator) -> &PreloadStore {
        if let Some(store) = self.preload.get() {
            warn!(
                "bcache: already bootstrapped on dev {}, ignoring dev {}",
                store.dev(),
                dev
            );
            return store;
        }
        self.preload.call_once(|| {
            let sb = self.read_superblock(dev);
            debug!("bcache: {:?}", sb);
            PreloadStore::bootstrap(self, dev, &sb, allocator)
        })
    }

    fn read_superblock(&self, dev: u32) -> SuperBlock {
        let buf = self.bread_ordinary(dev, SUPER_BLOCK_ID);
        let sb = *buf.data().get_ref::<SuperBlock>(0);
        drop(buf);
        if !sb.is_valid() {
            fatal(Violation::BadMagic {
                dev,
                magic: sb.magic(),
            });
        }
        if let Some(reason) = sb.check_geometry() {
            fatal(Violation::BadGeometry { dev, reason });
        }
        sb
    }

    /// 初始化完成后的预载区
    pub fn preloaded(&self) -> Option<&PreloadStore> {
        self.preload.get()
    }

    /// (dev, blockno) 是否由预载区提供.
    ///
    /// 初始化之前, 或者块不在可预载区域内时, 不读位图直接返回 false.
    /// 位图块本身在可预载区域之外, 读它不会再次进入这里.
    pub fn is_preloaded_block(&self, dev: u32, blockno: u32) -> bool {
        let store = match self.preload.get() {
            Some(store) => store,
            None => return false,
        };
        let sb = store.superblock();
        if dev != store.dev() || !sb.is_preloadable(blockno) {
            return false;
        }
        Bitmap::of(sb).test(self, dev, blockno)
    }

    /// 在预载区中查找 (dev, blockno) 并上锁.
    /// 找不到说明镜像与初始化结果不一致, 直接终止.
    pub fn lookup_preloaded(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let store = self
            .preload
            .get()
            .unwrap_or_else(|| fatal(Violation::PreloadNotReady { dev, blockno }));
        let index = store
            .lookup(dev, blockno)
            .unwrap_or_else(|| fatal(Violation::PreloadMiss { dev, blockno }));
        trace!("bcache: preloaded hit ({}, {})", dev, blockno);
        Buf {
            bcache: self,
            slot: Slot::Preloaded(index),
            dev,
            blockno,
            data: Some(store.slot(index).data.lock()),
        }
    }

    /// 分类后从对应的存储中取出上锁的缓冲区, 内容不一定有效
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        if self.is_preloaded_block(dev, blockno) {
            return self.lookup_preloaded(dev, blockno);
        }
        self.bget_ordinary(dev, blockno)
    }

    /// 在普通缓存中查找 (dev, blockno), 找不到则回收最久未使用的空闲缓冲区.
    ///
    /// 自旋锁在拿睡眠锁之前就已释放, 等待内容锁期间不会挡住其他块的查找.
    fn bget_ordinary(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut ctrl = self.ctrl.lock();
        let index = if let Some(index) = ctrl.find_cached(dev, blockno) {
            trace!("bcache: hit ({}, {}) in buffer {}", dev, blockno, index);
            index
        } else if let Some(index) = ctrl.recycle(dev, blockno) {
            self.bufs[index].valid.store(false, Ordering::Release);
            index
        } else {
            fatal(Violation::PoolExhausted { dev, blockno })
        };
        drop(ctrl);

        Buf {
            bcache: self,
            slot: Slot::Ordinary(index),
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 返回一个已上锁且内容有效的缓冲区
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut buf = self.bget(dev, blockno);
        self.fill(&mut buf);
        buf
    }

    /// 跳过分类, 只走普通缓存. 读超级块, 位图以及初始化时读数据块都用它.
    ///
    /// 初始化完成后, 由预载区提供的块不能再从这里拿, 否则同一个块会有两个持有者.
    /// 位图块在可预载区域之外, 这里的检查不会读位图.
    pub(super) fn bread_ordinary(&self, dev: u32, blockno: u32) -> Buf<'_> {
        if self.is_preloaded_block(dev, blockno) {
            fatal(Violation::PreloadBypass { dev, blockno });
        }
        let mut buf = self.bget_ordinary(dev, blockno);
        self.fill(&mut buf);
        buf
    }

    /// 内容无效时从磁盘读入. 预载槽位在初始化时就已读入.
    fn fill(&self, buf: &mut Buf<'_>) {
        if let Slot::Ordinary(index) = buf.slot {
            if !self.bufs[index].valid.load(Ordering::Acquire) {
                self.rw(buf, false);
                self.bufs[index].valid.store(true, Ordering::Release);
            }
        }
    }

    fn rw(&self, buf: &mut Buf<'_>, write: bool) {
        let device = self.device(buf.dev);
        debug!(
            "bcache: {} block {} on dev {}",
            if write { "write" } else { "read" },
            buf.blockno,
            buf.dev
        );
        if write {
            device.write_block(buf.blockno as usize, buf.data().as_bytes());
        } else {
            device.read_block(buf.blockno as usize, buf.data_mut().as_bytes_mut());
        }
    }

    /// 丢掉普通缓存中 (dev, blockno) 的空闲副本, 该块此后由预载区提供
    pub(super) fn forget(&self, dev: u32, blockno: u32) {
        let mut ctrl = self.ctrl.lock();
        if let Some(index) = ctrl.index_of(dev, blockno) {
            if !ctrl.forget(index) {
                warn!(
                    "bcache: block {} on dev {} still referenced, ordinary copy kept",
                    blockno, dev
                );
            }
        }
    }

    /// 从最近使用到最久未使用列出普通缓存中的块
    pub fn cached(&self) -> Vec<(u32, u32)> {
        self.ctrl.lock().order()
    }

    /// 普通缓存中 (dev, blockno) 的引用计数, 不在缓存中时为 None
    pub fn refcnt(&self, dev: u32, blockno: u32) -> Option<usize> {
        let ctrl = self.ctrl.lock();
        ctrl.index_of(dev, blockno).map(|index| ctrl.refcnt(index))
    }
}

/// 一个已上锁的缓冲区.
///
/// 持有它就独占了块内容. drop 时先解锁, 再按来源做释放:
/// 普通缓冲区引用计数减一 (降到 0 时移到 LRU 最近使用端), 预载槽位什么也不做.
pub struct Buf<'a> {
    bcache: &'a Bcache,
    slot: Slot,
    dev: u32,
    blockno: u32,
    /// 只在 drop 时被取走
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 是否来自预载区
    pub fn is_preloaded(&self) -> bool {
        matches!(self.slot, Slot::Preloaded(_))
    }

    fn guard(&self) -> &SleepLockGuard<'a, BufData> {
        match &self.data {
            Some(guard) => guard,
            None => fatal(Violation::ReleaseNotHeld {
                dev: self.dev,
                blockno: self.blockno,
            }),
        }
    }

    pub fn data(&self) -> &BufData {
        &**self.guard()
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        let (dev, blockno) = (self.dev, self.blockno);
        match &mut self.data {
            Some(guard) => &mut **guard,
            None => fatal(Violation::ReleaseNotHeld { dev, blockno }),
        }
    }

    /// 把缓冲区内容写回磁盘, 调用者必须持有内容锁
    pub fn bwrite(&mut self) {
        if !self.guard().holding() {
            fatal(Violation::WriteUnlocked {
                dev: self.dev,
                blockno: self.blockno,
            });
        }
        let bcache = self.bcache;
        bcache.rw(self, true);
    }

    /// 增加引用计数而不持有内容锁, 让缓冲区在释放后仍然常驻.
    /// 预载槽位本就不会被换出, 此时什么也不做.
    pub fn pin(&self) -> PinnedBuf<'a> {
        if let Slot::Ordinary(index) = self.slot {
            self.bcache.ctrl.lock().pin(index);
            trace!("bcache: pin ({}, {})", self.dev, self.blockno);
        }
        PinnedBuf {
            bcache: self.bcache,
            slot: self.slot,
            dev: self.dev,
            blockno: self.blockno,
        }
    }

    /// 释放缓冲区, 与直接 drop 相同
    pub fn release(self) {}
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        let guard = match self.data.take() {
            Some(guard) => guard,
            None => return,
        };
        if !guard.holding() {
            fatal(Violation::ReleaseNotHeld {
                dev: self.dev,
                blockno: self.blockno,
            });
        }
        drop(guard);
        if let Slot::Ordinary(index) = self.slot {
            self.bcache.ctrl.lock().release(index);
        }
    }
}

/// [`Buf::pin`] 留下的凭证, 交给 [`PinnedBuf::unpin`] 撤销
#[must_use = "a pinned buffer stays resident until unpinned"]
pub struct PinnedBuf<'a> {
    bcache: &'a Bcache,
    slot: Slot,
    dev: u32,
    blockno: u32,
}

impl PinnedBuf<'_> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 引用计数减一. 不调整 LRU 位置, 也不需要持有内容锁.
    pub fn unpin(self) {
        if let Slot::Ordinary(index) = self.slot {
            self.bcache.ctrl.lock().unpin(index);
            trace!("bcache: unpin ({}, {})", self.dev, self.blockno);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::fs::{ImageBuilder, PagePool};

    fn bcache(nbuf: usize, blocks: usize) -> (Bcache, Arc<MemDisk>) {
        let disk = Arc::new(MemDisk::new(blocks));
        let devices: Vec<Arc<dyn BlockDevice>> = vec![disk.clone()];
        (Bcache::new(nbuf, devices), disk)
    }

    #[test]
    fn read_fills_once() {
        let (bcache, disk) = bcache(4, 16);
        disk.fill_block(3, 0xab);
        let buf = bcache.bread(0, 3);
        assert!(buf.data().as_bytes().iter().all(|&b| b == 0xab));
        assert!(!buf.is_preloaded());
        drop(buf);
        let buf = bcache.bread(0, 3);
        assert_eq!(buf.blockno(), 3);
        drop(buf);
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn release_drops_reference() {
        let (bcache, _disk) = bcache(4, 16);
        let buf = bcache.bread(0, 5);
        assert_eq!(bcache.refcnt(0, 5), Some(1));
        buf.release();
        assert_eq!(bcache.refcnt(0, 5), Some(0));
        assert_eq!(bcache.cached()[0], (0, 5));
    }

    #[test]
    fn pin_survives_release() {
        let (bcache, _disk) = bcache(1, 16);
        let buf = bcache.bread(0, 2);
        let pinned = buf.pin();
        drop(buf);
        assert_eq!(bcache.refcnt(0, 2), Some(1));
        pinned.unpin();
        assert_eq!(bcache.refcnt(0, 2), Some(0));
        drop(bcache.bread(0, 3));
        assert_eq!(bcache.refcnt(0, 2), None);
    }

    #[test]
    #[should_panic(expected = "no buffers")]
    fn exhausted_pool_is_fatal() {
        let (bcache, _disk) = bcache(2, 16);
        let _a = bcache.bread(0, 1);
        let _b = bcache.bread(0, 2);
        let _c = bcache.bread(0, 3);
    }

    #[test]
    #[should_panic(expected = "no block device with id 1")]
    fn unknown_device_is_fatal() {
        let (bcache, _disk) = bcache(2, 16);
        let _buf = bcache.bread(1, 0);
    }

    /// 制作一个只标记了 marked 的镜像并在同一个缓存上挂载
    fn mounted(nbuf: usize, marked: &[u32]) -> (Bcache, Arc<MemDisk>) {
        let (bcache, disk) = bcache(nbuf, 64);
        let region = ImageBuilder::default_region(64, 48);
        let mut builder = ImageBuilder::create(&bcache, 0, 64, region);
        for &blockno in marked {
            builder.mark(blockno);
        }
        for &blockno in marked {
            disk.fill_block(blockno as usize, blockno as u8);
        }
        bcache.bootstrap(0, &PagePool::unbounded());
        (bcache, disk)
    }

    #[test]
    fn bootstrap_leaves_no_ordinary_copies() {
        let (bcache, _disk) = mounted(8, &[10, 15]);
        assert_eq!(bcache.refcnt(0, 10), None);
        assert_eq!(bcache.refcnt(0, 15), None);
        assert!(!bcache.cached().contains(&(0, 15)));
    }

    #[test]
    fn ordinary_path_still_serves_metadata() {
        let (bcache, _disk) = mounted(8, &[15]);
        let sb = *bcache.bread_ordinary(0, SUPER_BLOCK_ID).data().get_ref::<SuperBlock>(0);
        assert_eq!(sb.preload_count, 1);
        assert!(!bcache.bread_ordinary(0, 7).is_preloaded());
    }

    #[test]
    #[should_panic(expected = "block 15 on dev 0 is preloaded")]
    fn ordinary_read_of_preloaded_block_is_fatal() {
        let (bcache, disk) = mounted(8, &[15]);
        let mut held = bcache.bread(0, 15);
        held.data_mut().as_bytes_mut().fill(0x5a);
        held.bwrite();
        assert!(disk.snapshot(15).iter().all(|&b| b == 0x5a));
        // 第二个持有者
        let _other = bcache.bread_ordinary(0, 15);
    }

    #[test]
    #[should_panic(expected = "before bootstrap")]
    fn preloaded_lookup_needs_bootstrap() {
        let (bcache, _disk) = bcache(2, 16);
        assert!(!bcache.is_preloaded_block(0, 3));
        let _buf = bcache.lookup_preloaded(0, 3);
    }
}
