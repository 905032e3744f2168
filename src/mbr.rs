use crate::block_device::LBA_SIZE;
use crate::error::BlockError;

/// MBR分区表在扇区内的偏移量
const MBR_TABLE_OFFSET: usize = 446;
/// MBR分区表项数量
pub const MBR_ENTRY_COUNT: usize = 4;
/// 引导扇区结尾签名
const MBR_TRAILSIG: u16 = 0xAA55;

/// @brief MBR硬盘分区表项的结构
///
/// CHS寻址字段在这里不保留：本层只使用LBA几何信息。
#[derive(Debug, Clone, Copy, Default)]
pub struct MbrDiskPartitionTableEntry {
    pub flags: u8,          // 引导标志符，标记此分区为活动分区
    pub part_type: u8,      // 分区类型ID
    pub starting_lba: u32,  // 起始逻辑扇区
    pub total_sectors: u32, // 分区占用的磁盘扇区数
}

impl MbrDiskPartitionTableEntry {
    /// 未使用的表项全零：类型与扇区数均非零才视为有效。
    /// 起始LBA允许为0（覆盖0号扇区的布局由上层照常发布）。
    pub fn is_valid(&self) -> bool {
        self.total_sectors != 0 && self.part_type != 0
    }
}

/// @brief MBR磁盘分区表结构体
#[derive(Debug, Clone, Copy, Default)]
pub struct MbrDiskPartitionTable {
    pub dpte: [MbrDiskPartitionTableEntry; MBR_ENTRY_COUNT],
    pub bs_trailsig: u16,
}

impl MbrDiskPartitionTable {
    /// # 从扇区镜像解析MBR分区表
    ///
    /// 重验流程通过驱动的I/O路径读取0号扇区后，用本函数解析其中的分区表。
    ///
    /// ## 参数
    ///
    /// - `buf`: 0号扇区的内容，长度至少为一个LBA
    ///
    /// ## 返回值
    ///
    /// - `Ok(MbrDiskPartitionTable)`: 成功解析的分区表实例
    /// - `Err(InvalidArgument)`: 缓冲区长度不足
    /// - `Err(PartitionTableInconsistent)`: 结尾签名损坏，磁盘应按无分区处理
    pub fn from_sector(buf: &[u8]) -> Result<MbrDiskPartitionTable, BlockError> {
        if buf.len() < LBA_SIZE {
            return Err(BlockError::InvalidArgument);
        }

        let mut table: MbrDiskPartitionTable = Default::default();
        for i in 0..MBR_ENTRY_COUNT {
            let offset = MBR_TABLE_OFFSET + 16 * i;
            table.dpte[i].flags = buf[offset];
            table.dpte[i].part_type = buf[offset + 4];
            table.dpte[i].starting_lba = read_u32_le(buf, offset + 8);
            table.dpte[i].total_sectors = read_u32_le(buf, offset + 12);
        }
        table.bs_trailsig = u16::from_le_bytes([buf[LBA_SIZE - 2], buf[LBA_SIZE - 1]]);

        if !table.is_valid() {
            return Err(BlockError::PartitionTableInconsistent);
        }
        return Ok(table);
    }

    pub fn is_valid(&self) -> bool {
        self.bs_trailsig == MBR_TRAILSIG
    }

    /// # 迭代有效的分区表项
    ///
    /// 产出`(slot, entry)`：slot是表项在MBR中的下标（0..4），
    /// 调用方按`slot + 1`得到分区号，0号保留给整盘伪分区。
    pub fn partitions_raw(&self) -> impl Iterator<Item = (usize, MbrDiskPartitionTableEntry)> + '_ {
        self.dpte
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_valid())
            .map(|(i, e)| (i, *e))
    }
}

#[inline]
fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// 构造包含给定(起始LBA, 扇区数)表项的0号扇区镜像，测试用
#[cfg(test)]
pub(crate) fn build_sector(entries: &[(u32, u32)]) -> alloc::vec::Vec<u8> {
    let mut buf = vec![0u8; LBA_SIZE];
    for (i, (start, count)) in entries.iter().enumerate() {
        let offset = MBR_TABLE_OFFSET + 16 * i;
        buf[offset + 4] = 0x83; // Linux分区类型
        buf[offset + 8..offset + 12].copy_from_slice(&start.to_le_bytes());
        buf[offset + 12..offset + 16].copy_from_slice(&count.to_le_bytes());
    }
    buf[LBA_SIZE - 2] = 0x55;
    buf[LBA_SIZE - 1] = 0xAA;
    return buf;
}
