use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hashbrown::HashMap;

use crate::block_device::{GeneralBlockRange, SectorT};
use crate::error::BlockError;
use crate::gendisk::GenDisk;

/// 卷名的最大长度
pub const PARTITION_META_INFO_VOLNAMELTH: usize = 64;
/// UUID字符串的最大长度（EFI UUID为36字符，MSDOS UUID为11字符，外加NUL）
pub const PARTITION_META_INFO_UUIDLTH: usize = 37;

/// 分区的元数据，仅当分区来自携带元数据的分区表格式时存在
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetaInfo {
    pub uuid: String,
    pub volname: String,
}

impl PartitionMetaInfo {
    pub fn new(uuid: &str, volname: &str) -> Result<Self, BlockError> {
        if uuid.len() > PARTITION_META_INFO_UUIDLTH
            || volname.len() > PARTITION_META_INFO_VOLNAMELTH
        {
            return Err(BlockError::InvalidArgument);
        }
        return Ok(PartitionMetaInfo {
            uuid: String::from(uuid),
            volname: String::from(volname),
        });
    }
}

/// @brief: 磁盘的分区信息
///
/// 分区号0是覆盖整个磁盘的伪分区，始终存在；其容量即磁盘容量，
/// 由`GenDisk::set_capacity`维护。分区对象一经发布即不再改变几何信息
/// （分区号、起始扇区），只有0号分区的扇区数与只读位可变，因此用原子量而非锁。
#[derive(Debug)]
pub struct Partition {
    partno: u32,
    start_sector: SectorT,
    sectors: AtomicU64,
    read_only: AtomicBool,
    meta: Option<PartitionMetaInfo>,
    disk: Weak<GenDisk>, // 当前分区所属的磁盘
}

impl Partition {
    pub(crate) fn new(
        partno: u32,
        start_sector: SectorT,
        sectors: SectorT,
        meta: Option<PartitionMetaInfo>,
        disk: Weak<GenDisk>,
    ) -> Arc<Self> {
        return Arc::new(Partition {
            partno,
            start_sector,
            sectors: AtomicU64::new(sectors),
            read_only: AtomicBool::new(false),
            meta,
            disk,
        });
    }

    #[inline]
    pub fn partno(&self) -> u32 {
        self.partno
    }

    #[inline]
    pub fn start_sector(&self) -> SectorT {
        self.start_sector
    }

    #[inline]
    pub fn sectors(&self) -> SectorT {
        self.sectors.load(Ordering::SeqCst)
    }

    /// 返回旧值，供调用者判断是否发生变化
    pub(crate) fn set_sectors(&self, sectors: SectorT) -> SectorT {
        self.sectors.swap(sectors, Ordering::SeqCst)
    }

    #[inline]
    pub fn read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn set_read_only(&self, ro: bool) {
        self.read_only.store(ro, Ordering::SeqCst);
    }

    pub fn meta(&self) -> Option<&PartitionMetaInfo> {
        self.meta.as_ref()
    }

    /// @brief 获取当前分区所属磁盘的Arc指针，磁盘已释放时返回None
    pub fn disk(&self) -> Option<Arc<GenDisk>> {
        self.disk.upgrade()
    }

    /// 分区覆盖的LBA范围，扇区数为0时返回None
    pub fn range(&self) -> Option<GeneralBlockRange> {
        GeneralBlockRange::new(
            self.start_sector as usize,
            (self.start_sector + self.sectors()) as usize,
        )
    }

    /// 几何信息是否一致（分区号、起始扇区、扇区数）
    pub(crate) fn same_geometry(&self, other: &Partition) -> bool {
        self.partno == other.partno
            && self.start_sector == other.start_sector
            && self.sectors() == other.sectors()
    }
}

/// @brief 磁盘的分区表
///
/// 以分区号为键的稀疏映射：分区号不必连续（扩展/逻辑分区的编号方案）。
/// 发布协议：新表完整构建后整体替换，读者在RwLock下看到的要么是完整的旧表，
/// 要么是完整的新表，不存在混合窗口。
#[derive(Debug)]
pub(crate) struct PartTable {
    parts: HashMap<u32, Arc<Partition>>,
}

impl PartTable {
    pub fn new(part0: Arc<Partition>) -> Self {
        let mut parts = HashMap::new();
        parts.insert(0, part0);
        return PartTable { parts };
    }

    pub fn lookup(&self, partno: u32) -> Option<Arc<Partition>> {
        self.parts.get(&partno).cloned()
    }

    /// @brief 原子地替换除0号分区之外的所有分区
    ///
    /// 调用者负责在持有写锁时调用；新分区对象在锁外完整构建。
    pub fn replace_all(&mut self, new_parts: Vec<Arc<Partition>>) {
        self.parts.retain(|partno, _| *partno == 0);
        for part in new_parts {
            debug_assert_ne!(part.partno(), 0);
            self.parts.insert(part.partno(), part);
        }
    }

    /// 移除除0号分区之外的所有分区，返回之前是否存在这样的分区
    pub fn drop_all(&mut self) -> bool {
        let had_parts = self.parts.len() > 1;
        self.parts.retain(|partno, _| *partno == 0);
        return had_parts;
    }

    /// 现有布局（不含0号分区）是否与候选布局一致
    pub fn layout_matches(&self, new_parts: &[Arc<Partition>]) -> bool {
        if self.parts.len() - 1 != new_parts.len() {
            return false;
        }
        for part in new_parts {
            match self.parts.get(&part.partno()) {
                Some(old) if old.same_geometry(part) => continue,
                _ => return false,
            }
        }
        return true;
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// 按分区号升序返回所有分区
    pub fn values_sorted(&self) -> Vec<Arc<Partition>> {
        let mut v: Vec<Arc<Partition>> = self.parts.values().cloned().collect();
        v.sort_by_key(|p| p.partno());
        return v;
    }
}
