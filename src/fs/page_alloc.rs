//! 页分配器接口
//!
//! 预载区在挂载时一次性申请一段连续的页, 之后永不释放.
//! 内核里由物理页分配器实现; 宿主机上用 [`PagePool`] 按页数记账.
//!
//! 这里只做额度检查: 分配器同意后, 槽位本身仍放在堆上的 `Vec` 里,
//! 分配器不交出内存. 拒绝即视为内存不足.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

pub trait PageAllocator: Send + Sync {
    /// 申请 count 个连续的页, 内存不足时返回 false
    fn alloc_pages(&self, count: usize) -> bool;
}

/// 有固定页数预算的页池, 只记账不持有内存
pub struct PagePool {
    free: AtomicUsize,
}

impl PagePool {
    pub fn new(pages: usize) -> Self {
        Self {
            free: AtomicUsize::new(pages),
        }
    }

    /// 不限页数, 供工具程序使用
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn free_pages(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }
}

impl PageAllocator for PagePool {
    fn alloc_pages(&self, count: usize) -> bool {
        let granted = self
            .free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| {
                free.checked_sub(count)
            })
            .is_ok();
        debug!("page pool: alloc {} pages -> {}", count, granted);
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_enforced() {
        let pool = PagePool::new(3);
        assert!(pool.alloc_pages(2));
        assert!(!pool.alloc_pages(2));
        assert!(pool.alloc_pages(1));
        assert_eq!(pool.free_pages(), 0);
        assert!(pool.alloc_pages(0));
    }
}
