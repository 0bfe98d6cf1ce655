//! 块设备仅支持以块为单位进行随机读写, 需要由具体的块设备驱动来实现这两个方法.
//! 块缓存层会调用这两个方法, 进行块缓存的管理.
//! 泛用性: 可以访问实现了 BlockDevice Trait 的块设备驱动程序.

use std::any::Any;

// 块设备接口层
// 定义设备驱动需要实现的块读写接口 BlockDevice trait
//
// 读写都是同步的: 调用者会一直阻塞到传输完成.
// 设备出错无法恢复, 由驱动自己终止 (见 fatal), 因此接口上没有错误返回值.

pub trait BlockDevice: Send + Sync + Any {
    // read_block 将编号为 block_id 的块从磁盘读入内存中的缓冲区 buf ;
    fn read_block(&self, block_id: usize, buf: &mut [u8]);

    // write_block 将内存中的缓冲区 buf 中的数据写入磁盘编号为 block_id 的块.
    fn write_block(&self, block_id: usize, buf: &[u8]);
}
