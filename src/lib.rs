//! 带预载区的磁盘块缓存
//!
//! 普通块走固定容量的 LRU 缓存; 镜像中标记为用户程序的块在挂载时一次性读入内存,
//! 之后常驻, 不参与换出.

pub mod device;
pub mod fs;
