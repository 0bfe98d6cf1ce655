//! 构建镜像
//!
//! [`ImageBuilder`] 知道每个区域所在的位置, 负责在块设备上写出超级块, 预载位图,
//! 并把用户程序写进可预载区域, 在位图中标记它们.
//! 这些都发生在制作镜像的时候; 挂载后缓存层不会再改动位图.
//!
//! Blocks: Super Block(0) -> Preload Bitmap Blocks -> Preload Region -> Data Blocks

use std::ops::Range;

use log::{debug, info};

use super::{fatal, Bcache, Bitmap, SuperBlock, Violation, BLOCK_SIZE, SUPER_BLOCK_ID};

type DataBlock = [u8; BLOCK_SIZE];

pub struct ImageBuilder<'a> {
    bcache: &'a Bcache,
    dev: u32,
    sb: SuperBlock,
}

impl<'a> ImageBuilder<'a> {
    /// 默认布局: 位图紧跟在超级块之后, 可预载区域紧跟在位图之后, 长度为 preload_blocks
    pub fn default_region(total_blocks: u32, preload_blocks: u32) -> Range<u32> {
        let start = SUPER_BLOCK_ID + 1 + SuperBlock::bitmap_blocks_for(total_blocks);
        start..start.saturating_add(preload_blocks).min(total_blocks)
    }

    /// 在设备 dev 上创建一个有 total_blocks 个块的镜像, 可预载区域为 preload.
    ///
    /// 位图从块 1 开始. 所有块先清零, 再写入超级块, 此时没有任何块被标记.
    pub fn create(bcache: &'a Bcache, dev: u32, total_blocks: u32, preload: Range<u32>) -> Self {
        let sb = SuperBlock::new(total_blocks, preload.start, preload.end, SUPER_BLOCK_ID + 1);
        if let Some(reason) = sb.check_geometry() {
            fatal(Violation::BadGeometry { dev, reason });
        }

        // 既然是创建镜像, 需要将块设备的前 total_blocks 个块清零
        for blockno in 0..total_blocks {
            let mut buf = bcache.bread(dev, blockno);
            buf.data_mut()
                .modify(0, |data_block: &mut DataBlock| data_block.fill(0));
            buf.bwrite();
        }

        let builder = Self { bcache, dev, sb };
        builder.flush_superblock();
        info!("image: formatted dev {}: {:?}", dev, builder.sb);
        builder
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    fn region(&self) -> Range<u32> {
        self.sb.preload_start..self.sb.preload_end
    }

    /// 可预载区域中尚未标记的块数
    pub fn free_blocks(&self) -> u32 {
        self.sb.preload_end - self.sb.preload_start - self.sb.preload_count
    }

    fn flush_superblock(&self) {
        let mut buf = self.bcache.bread(self.dev, SUPER_BLOCK_ID);
        let sb = self.sb;
        buf.data_mut()
            .modify(0, |super_block: &mut SuperBlock| *super_block = sb);
        buf.bwrite();
    }

    /// 把 blockno 标记为用户程序块, 并更新超级块中的计数
    pub fn mark(&mut self, blockno: u32) {
        if !self.sb.is_preloadable(blockno) {
            fatal(Violation::PreloadOutsideRegion {
                dev: self.dev,
                blockno,
            });
        }
        if Bitmap::of(&self.sb).set(self.bcache, self.dev, blockno) {
            self.sb.preload_count += 1;
            self.flush_superblock();
        }
    }

    /// 把一个用户程序写进可预载区域中尚未标记的块, 并标记这些块.
    ///
    /// 返回程序依次占用的块号; 剩余空间不够时什么也不写, 返回 None.
    pub fn install(&mut self, program: &[u8]) -> Option<Vec<u32>> {
        let needed = (program.len() + BLOCK_SIZE - 1) / BLOCK_SIZE;
        if needed > self.free_blocks() as usize {
            return None;
        }
        let bitmap = Bitmap::of(&self.sb);
        let mut blocks = Vec::with_capacity(needed);
        for chunk in program.chunks(BLOCK_SIZE) {
            let blockno = bitmap.alloc_in(self.bcache, self.dev, self.region())?;
            let mut buf = self.bcache.bread(self.dev, blockno);
            let bytes = buf.data_mut().as_bytes_mut();
            bytes[..chunk.len()].copy_from_slice(chunk);
            bytes[chunk.len()..].fill(0);
            buf.bwrite();
            debug!("image: program block {} -> {}", blocks.len(), blockno);
            blocks.push(blockno);
        }
        self.sb.preload_count += blocks.len() as u32;
        self.flush_superblock();
        Some(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_follows_bitmap() {
        assert_eq!(ImageBuilder::default_region(64, 48), 2..50);
        assert_eq!(ImageBuilder::default_region(64, 100), 2..64);
        assert_eq!(ImageBuilder::default_region(64, u32::MAX), 2..64);
    }
}
