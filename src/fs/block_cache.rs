//! 块缓存层: 在内存中缓存磁盘块的数据, 避免频繁读写磁盘
//!
//! 由于操作系统频繁读写速度缓慢的磁盘块会极大降低系统性能,
//! 常见的手段是先把一个块上的数据从磁盘读到内存中的一个缓冲区 [`BufData`] 中,
//! 后续对这个数据块的大部分访问就可以在内存中完成了.
//!
//! 普通缓存池是固定数量的缓冲区, 分成两部分管理:
//!
//! - 控制信息 [`BufCtrl`] (设备号, 块号, 引用计数, LRU 链表指针) 统一放在 [`BufLru`] 中,
//!   由一把自旋锁保护. 这把锁只在修改链表和引用计数的极短时间内持有, 绝不跨越磁盘等待.
//! - 数据 [`BufInner`] (有效位和块内容) 每个缓冲区各有一把睡眠锁,
//!   持有者可以在持锁期间等待磁盘 I/O.
//!
//! LRU 链表是一个以下标寻址的定长数组, 最后一个节点是哨兵 head:
//! head.next 是最近使用的缓冲区, head.prev 是最久未使用的缓冲区.

use std::sync::atomic::AtomicBool;

use log::debug;

use super::{fatal, SleepLock, Violation, BLOCK_SIZE};

/// 一个块大小的缓冲区, 8 字节对齐以便把磁盘上的数据结构直接映射上来
#[repr(C, align(8))]
pub struct BufData(pub [u8; BLOCK_SIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BLOCK_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// 得到缓冲区中指定偏移量 offset 的字节地址
    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.0[offset] as *const u8 as usize
    }

    /// 获取缓冲区中的位于偏移量 offset 的一个类型为 T 的磁盘上数据结构的不可变引用.
    pub fn get_ref<T>(&self, offset: usize) -> &T
    where
        T: Sized,
    {
        let type_size = std::mem::size_of::<T>();
        // 确认 T 被整个包含在磁盘块及其缓冲区之内
        assert!(offset + type_size <= BLOCK_SIZE);
        assert_eq!(offset % std::mem::align_of::<T>(), 0);
        let addr = self.addr_of_offset(offset);
        unsafe { &*(addr as *const T) }
    }

    pub fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        let type_size = std::mem::size_of::<T>();
        assert!(offset + type_size <= BLOCK_SIZE);
        assert_eq!(offset % std::mem::align_of::<T>(), 0);
        let addr = self.addr_of_offset(offset);
        unsafe { &mut *(addr as *mut T) }
    }

    /// 把偏移 offset 处的数据解释为 T 并交给闭包 f 读取
    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    /// 把偏移 offset 处的数据解释为 T 并交给闭包 f 修改.
    /// 修改只发生在内存中, 需要调用者之后显式写回.
    pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

/// 缓冲区的数据部分
pub(super) struct BufInner {
    /// 缓冲区内容是否已经从磁盘读入
    pub(super) valid: AtomicBool,
    pub(super) data: SleepLock<BufData>,
}

impl BufInner {
    pub(super) fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new()),
        }
    }
}

/// 缓冲区的控制信息, 只能在持有 `BufLru` 的自旋锁时访问
#[derive(Debug, Clone, Copy)]
struct BufCtrl {
    dev: u32,
    blockno: u32,
    refcnt: usize,
    prev: usize,
    next: usize,
}

/// 按最近使用顺序排列的普通缓存池控制信息
pub(super) struct BufLru {
    /// 前 nbuf 项与 `Bcache::bufs` 一一对应, 最后一项是哨兵
    inner: Vec<BufCtrl>,
}

impl BufLru {
    /// 建立容量为 nbuf 的环形双向链表, 所有缓冲区初始引用计数为 0
    pub(super) fn new(nbuf: usize) -> Self {
        assert!(nbuf > 0, "buffer cache needs at least one buffer");
        let head = nbuf;
        let mut lru = Self {
            inner: vec![
                // 未使用的缓冲区挂在一个不存在的设备上, 不会被命中
                BufCtrl {
                    dev: u32::MAX,
                    blockno: 0,
                    refcnt: 0,
                    prev: head,
                    next: head,
                };
                nbuf + 1
            ],
        };
        for index in 0..nbuf {
            lru.push_front(index);
        }
        lru
    }

    fn head(&self) -> usize {
        self.inner.len() - 1
    }

    pub(super) fn capacity(&self) -> usize {
        self.inner.len() - 1
    }

    /// 从最近使用端开始查找已缓存的块, 命中则引用计数加一
    pub(super) fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let head = self.head();
        let mut index = self.inner[head].next;
        while index != head {
            let b = &mut self.inner[index];
            if b.dev == dev && b.blockno == blockno {
                b.refcnt += 1;
                return Some(index);
            }
            index = b.next;
        }
        None
    }

    /// 从最久未使用端开始寻找引用计数为 0 的缓冲区, 改为缓存 (dev, blockno)
    pub(super) fn recycle(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let head = self.head();
        let mut index = self.inner[head].prev;
        while index != head {
            let b = &mut self.inner[index];
            if b.refcnt == 0 {
                debug!(
                    "bcache: recycle buffer {} ({}, {}) -> ({}, {})",
                    index, b.dev, b.blockno, dev, blockno
                );
                b.dev = dev;
                b.blockno = blockno;
                b.refcnt = 1;
                return Some(index);
            }
            index = b.prev;
        }
        None
    }

    /// 引用计数减一, 降到 0 时移到最近使用端
    pub(super) fn release(&mut self, index: usize) {
        let b = &mut self.inner[index];
        if b.refcnt == 0 {
            fatal(Violation::ReleaseNotHeld {
                dev: b.dev,
                blockno: b.blockno,
            });
        }
        b.refcnt -= 1;
        if b.refcnt == 0 {
            self.detach(index);
            self.push_front(index);
        }
    }

    pub(super) fn pin(&mut self, index: usize) {
        self.inner[index].refcnt += 1;
    }

    pub(super) fn unpin(&mut self, index: usize) {
        let b = &mut self.inner[index];
        if b.refcnt == 0 {
            fatal(Violation::UnpinUnderflow {
                dev: b.dev,
                blockno: b.blockno,
            });
        }
        b.refcnt -= 1;
    }

    pub(super) fn refcnt(&self, index: usize) -> usize {
        self.inner[index].refcnt
    }

    /// 让空闲的缓冲区不再对应任何块, 并移到最久未使用端.
    /// 仍有引用时什么也不做, 返回 false.
    pub(super) fn forget(&mut self, index: usize) -> bool {
        let b = &mut self.inner[index];
        if b.refcnt != 0 {
            return false;
        }
        b.dev = u32::MAX;
        b.blockno = 0;
        self.detach(index);
        self.push_back(index);
        true
    }

    /// 只查找不计数
    pub(super) fn index_of(&self, dev: u32, blockno: u32) -> Option<usize> {
        self.inner[..self.capacity()]
            .iter()
            .position(|b| b.dev == dev && b.blockno == blockno)
    }

    /// 从最近使用到最久未使用依次列出缓存的 (dev, blockno)
    pub(super) fn order(&self) -> Vec<(u32, u32)> {
        let head = self.head();
        let mut order = Vec::with_capacity(self.capacity());
        let mut index = self.inner[head].next;
        while index != head {
            order.push((self.inner[index].dev, self.inner[index].blockno));
            index = self.inner[index].next;
        }
        order
    }

    fn detach(&mut self, index: usize) {
        let BufCtrl { prev, next, .. } = self.inner[index];
        self.inner[next].prev = prev;
        self.inner[prev].next = next;
    }

    fn push_back(&mut self, index: usize) {
        let head = self.head();
        let last = self.inner[head].prev;
        self.inner[index].prev = last;
        self.inner[index].next = head;
        self.inner[last].next = index;
        self.inner[head].prev = index;
    }

    fn push_front(&mut self, index: usize) {
        let head = self.head();
        let first = self.inner[head].next;
        self.inner[index].next = first;
        self.inner[index].prev = head;
        self.inner[first].prev = index;
        self.inner[head].next = index;
    }
}
