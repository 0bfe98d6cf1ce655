//! 睡眠锁
//!
//! 缓冲区的内容锁可能在一次磁盘 I/O 期间一直被持有, 自旋等待会白白占用 CPU,
//! 所以争用者在条件变量上睡眠, 直到持有者释放后被唤醒.
//!
//! 锁内部用一把很短的互斥锁保护 "当前持有者" 这一状态, 数据本身放在 UnsafeCell 中,
//! 只有拿到 [`SleepLockGuard`] 的线程才能访问.

use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    thread::{self, ThreadId},
};

use parking_lot::{Condvar, Mutex};

pub struct SleepLock<T: ?Sized> {
    /// 当前持有者, None 表示空闲
    holder: Mutex<Option<ThreadId>>,
    wakeup: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            holder: Mutex::new(None),
            wakeup: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取锁, 锁被占用时当前线程睡眠等待
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut holder = self.holder.lock();
        while holder.is_some() {
            self.wakeup.wait(&mut holder);
        }
        *holder = Some(thread::current().id());
        drop(holder);

        SleepLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// 当前线程是否持有该锁
    pub fn holding(&self) -> bool {
        *self.holder.lock() == Some(thread::current().id())
    }

    fn unlock(&self) {
        let mut holder = self.holder.lock();
        *holder = None;
        drop(holder);
        self.wakeup.notify_one();
    }
}

/// 持锁凭证, drop 时释放锁并唤醒一个等待者.
///
/// 凭证不能跨线程移动: 谁加的锁就由谁释放.
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn holder_is_tracked() {
        let lock = SleepLock::new(0u32);
        assert!(!lock.holding());
        let guard = lock.lock();
        assert!(guard.holding());
        assert!(lock.holding());
        drop(guard);
        assert!(!lock.holding());
    }

    #[test]
    fn other_thread_is_not_holder() {
        let lock = Arc::new(SleepLock::new(()));
        let _guard = lock.lock();
        let other = Arc::clone(&lock);
        assert!(!thread::spawn(move || other.holding()).join().unwrap());
    }

    #[test]
    fn excludes_across_sleeps() {
        let lock = Arc::new(SleepLock::new((0usize, false)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let mut guard = lock.lock();
                        assert!(!guard.1, "two holders at once");
                        guard.1 = true;
                        // 持锁期间睡眠, 模拟一次磁盘等待
                        thread::sleep(Duration::from_micros(50));
                        guard.0 += 1;
                        guard.1 = false;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.lock().0, 8 * 20);
    }
}
