use crate::fs::{fatal, BlockDevice, Violation, BLOCK_SIZE};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

pub struct BlockFile(pub Mutex<File>);

// std::file::File 由 Rust 标准库 std 提供，可以访问 Linux 上的一个文件。
// 我们将它包装成 BlockFile 类型来模拟一块磁盘，为它实现 BlockDevice 接口。
// 注意 File 本身仅通过 read/write 接口是不能实现随机读写的，
// 在访问一个特定的块的时候，我们必须先 seek 到这个块的开头位置
//
// 磁盘出错无法恢复, 直接 fatal

impl BlockFile {
    fn transfer(&self, block_id: usize, write: bool, op: impl FnOnce(&mut File) -> std::io::Result<()>) {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let result = file
            .seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .and_then(|_| op(&mut *file));
        if result.is_err() {
            fatal(Violation::DeviceIo {
                blockno: block_id as u32,
                write,
            });
        }
    }
}

impl BlockDevice for BlockFile {
    /// 读取一个块从文件
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        self.transfer(block_id, false, |file| file.read_exact(buf));
    }

    /// 写一个块到文件
    fn write_block(&self, block_id: usize, buf: &[u8]) {
        self.transfer(block_id, true, |file| file.write_all(buf));
    }
}

/// 内存中的块设备, 记录读写次数, 用于测试
pub struct MemDisk {
    blocks: spin::Mutex<Vec<[u8; BLOCK_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new(total_blocks: usize) -> Self {
        Self {
            blocks: spin::Mutex::new(vec![[0; BLOCK_SIZE]; total_blocks]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 绕过缓存直接改写磁盘上的一个块, 不计入读写次数
    pub fn fill_block(&self, block_id: usize, byte: u8) {
        self.blocks.lock()[block_id] = [byte; BLOCK_SIZE];
    }

    /// 绕过缓存直接读出磁盘上的一个块, 不计入读写次数
    pub fn snapshot(&self, block_id: usize) -> [u8; BLOCK_SIZE] {
        self.blocks.lock()[block_id]
    }

    fn check(&self, block_id: usize, write: bool) {
        if block_id >= self.blocks.lock().len() {
            fatal(Violation::DeviceIo {
                blockno: block_id as u32,
                write,
            });
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        self.check(block_id, false);
        self.reads.fetch_add(1, Ordering::SeqCst);
        buf.copy_from_slice(&self.blocks.lock()[block_id]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        self.check(block_id, true);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.blocks.lock()[block_id].copy_from_slice(buf);
    }
}
