use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::fmt::Debug;

use crate::error::BlockError;
use crate::events::{DiskEventFlags, DiskEventKind};
use crate::gendisk::GenDisk;

/// 定义类型
pub type BlockId = usize;
pub type SectorT = u64;

/// 在本层中，我们认为磁盘的每个LBA大小均为512字节。（注意，文件系统的1个扇区可能事实上是多个LBA）
pub const LBA_SIZE: usize = 512;
/// 磁盘名的最大长度
pub const DISK_NAME_LEN: usize = 32;

/// 块设备名（在管理器命名空间内唯一）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevName(Arc<String>);

impl DevName {
    pub fn new(name: &str) -> Result<Self, BlockError> {
        if name.is_empty() || name.len() > DISK_NAME_LEN {
            return Err(BlockError::InvalidArgument);
        }
        return Ok(DevName(Arc::new(String::from(name))));
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for DevName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneralBlockRange {
    pub lba_start: usize,
    pub lba_end: usize,
}

impl GeneralBlockRange {
    pub fn new(lba_start: usize, lba_end: usize) -> Option<Self> {
        if lba_start >= lba_end {
            return None;
        }
        return Some(GeneralBlockRange { lba_start, lba_end });
    }

    #[inline]
    pub fn len(&self) -> usize {
        return self.lba_end - self.lba_start;
    }

    /// 取交集，不相交时返回None
    pub fn intersects_with(&self, rhs: &Self) -> Option<Self> {
        if self.lba_start <= rhs.lba_end && self.lba_end >= rhs.lba_start {
            let start = usize::max(self.lba_start, rhs.lba_start);
            let end = usize::min(self.lba_end, rhs.lba_end);
            return GeneralBlockRange::new(start, end);
        } else {
            return None;
        }
    }
}

/// @brief 块设备驱动应该实现的操作（磁盘的操作表）
///
/// 本层只依赖其中的慢速路径：容量探测、分区表扇区读取、事件查询。
/// I/O请求提交路径不在本层定义。
pub trait BlockDevice: Debug + Send + Sync {
    /// 探测设备当前容量（单位：扇区）。可能阻塞在I/O上。
    ///
    /// 返回0表示当前没有介质（可移动介质设备拔出介质后的状态）。
    fn probe_capacity(&self) -> Result<SectorT, BlockError>;

    /// 从第lba_id_start个LBA开始，同步读取count个LBA到buf中。
    ///
    /// 重验流程用它读取分区表扇区；调用时不持有任何磁盘锁。
    fn read_at_sync(
        &self,
        lba_id_start: BlockId,
        count: usize,
        buf: &mut [u8],
    ) -> Result<usize, BlockError>;

    /// 查询自上次调用以来发生的事件，并清除clearing中指明的事件。
    ///
    /// 没有事件时必须返回空集（幂等）。允许短暂阻塞在状态查询上，
    /// 但不允许执行完整的介质探测。
    fn check_events(&self, _clearing: DiskEventKind) -> DiskEventKind {
        DiskEventKind::empty()
    }

    /// 驱动支持的事件类型集合
    fn supported_events(&self) -> DiskEventKind {
        DiskEventKind::empty()
    }

    /// 事件处理策略标志
    fn event_flags(&self) -> DiskEventFlags {
        DiskEventFlags::UEVENT
    }
}

/// 对外通知的事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskUevent {
    Add,
    Remove,
    Resize,
    MediaChange,
    Eject,
}

/// @brief 设备模型/用户态发现层的通知接口
///
/// 本层保证at-least-once投递，接收方应当按幂等处理。
pub trait DiskNotifier: Send + Sync {
    fn announce(&self, disk: &Arc<GenDisk>, event: DiskUevent);

    /// I/O完成时的熵收集钩子，尽力而为。缺失或失败不影响本层的正确性。
    fn add_disk_randomness(&self, _disk: &Arc<GenDisk>) {}
}

/// 不产生任何通知的实现
pub struct NullNotifier;

impl DiskNotifier for NullNotifier {
    fn announce(&self, _disk: &Arc<GenDisk>, _event: DiskUevent) {}
}
