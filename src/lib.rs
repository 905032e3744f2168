//! 通用块设备抽象层
//!
//! 在具体驱动（SCSI/NVMe/virtio/loop等）与上层（文件系统、用户态发现）之间
//! 提供统一的磁盘模型：
//!
//! - 磁盘与分区的生命周期管理（分配、注册、注销、确定性回收）
//! - (major, minor)设备号命名空间的分配
//! - 容量跟踪与重验（容量探测 + 分区表重扫描）
//! - 介质事件子系统（介质更换/弹出请求，带节流的轮询）
//! - 打开/关闭仲裁与只读强制
//! - 堆叠设备的holder链接协议（RAID/LVM等声明对下层设备的依赖）
//!
//! 本层不实现I/O请求队列与调度：`BlockDevice`操作表只覆盖慢速路径
//! （容量探测、分区表扇区读取、事件查询）。
#![no_std]
#![allow(clippy::needless_return)]

#[macro_use]
extern crate alloc;

#[cfg(test)]
extern crate std;

mod block_device;
mod device_number;
mod error;
mod events;
mod gendisk;
mod holder;
mod manager;
mod map;
mod mbr;
mod partition;
mod revalidate;

pub use block_device::{
    BlockDevice, BlockId, DevName, DiskNotifier, DiskUevent, GeneralBlockRange, NullNotifier,
    SectorT, DISK_NAME_LEN, LBA_SIZE,
};
pub use device_number::{DeviceNumber, Major};
pub use error::BlockError;
pub use events::{
    DiskEventFlags, DiskEventKind, DiskEvents, EventPoller, DISK_EVENT_DFL_POLL_MSECS,
};
pub use gendisk::{
    BadBlocks, BlkIntegrity, BlockDevHandle, DiskState, GdStateFlags, GenDisk, GenDiskFlags,
};
pub use manager::BlockDevManager;
pub use map::{BlkDevMap, DeviceStruct};
pub use mbr::{MbrDiskPartitionTable, MbrDiskPartitionTableEntry, MBR_ENTRY_COUNT};
pub use partition::{
    Partition, PartitionMetaInfo, PARTITION_META_INFO_UUIDLTH, PARTITION_META_INFO_VOLNAMELTH,
};
