use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use log::{error, info, warn};
use spin::{Mutex, MutexGuard};

use crate::block_device::{BlockDevice, DevName, DiskNotifier, DiskUevent};
use crate::device_number::DeviceNumber;
use crate::error::BlockError;
use crate::gendisk::{DiskState, GenDisk, GenDiskFlags};
use crate::holder::HolderLinks;
use crate::map::BlkDevMap;
use crate::partition::Partition;

/// @brief 磁盘设备管理器
///
/// 持有设备号分配器、磁盘名索引、holder关系表与全局序列号计数器。
/// 不是全局单例：以Arc显式传递给驱动，便于在测试中构造独立实例。
///
/// 锁序约定：管理器锁 → 磁盘inner锁 → holder关系锁，
/// 任何路径都不得以相反顺序嵌套。
pub struct BlockDevManager {
    inner: Mutex<InnerBlockDevManager>,
    holders: HolderLinks,
    /// 全局递增，任何磁盘绑定介质时从这里取号。
    /// 同一设备号区段上注销+重注册的磁盘序列号因此严格递增。
    diskseq: AtomicU64,
    notifier: Arc<dyn DiskNotifier>,
}

struct InnerBlockDevManager {
    disks: HashMap<DevName, Arc<GenDisk>>,
    map: BlkDevMap,
}

impl BlockDevManager {
    pub fn new(notifier: Arc<dyn DiskNotifier>) -> Arc<Self> {
        Arc::new(BlockDevManager {
            inner: Mutex::new(InnerBlockDevManager {
                disks: HashMap::new(),
                map: BlkDevMap::new(),
            }),
            holders: HolderLinks::new(),
            diskseq: AtomicU64::new(0),
            notifier,
        })
    }

    fn inner(&self) -> MutexGuard<'_, InnerBlockDevManager> {
        self.inner.lock()
    }

    pub(crate) fn next_diskseq(&self) -> u64 {
        self.diskseq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn DiskNotifier> {
        &self.notifier
    }

    pub(crate) fn notify(&self, disk: &Arc<GenDisk>, event: DiskUevent) {
        self.notifier.announce(disk, event);
    }

    /// # 分配磁盘身份
    ///
    /// 预留设备号区段并创建处于Allocated状态的磁盘对象，对外不可见。
    ///
    /// ## 参数
    ///
    /// - `name`: 磁盘名，管理器命名空间内唯一
    /// - `ops`: 驱动操作表
    /// - `node_hint`: 起始设备号，主设备号为0时动态分配
    /// - `minors`: 次设备号数量（含分区）
    /// - `flags`: 能力标志
    pub fn alloc_disk(
        self: &Arc<Self>,
        name: &str,
        ops: Arc<dyn BlockDevice>,
        node_hint: DeviceNumber,
        minors: u32,
        flags: GenDiskFlags,
    ) -> Result<Arc<GenDisk>, BlockError> {
        let name = DevName::new(name)?;
        let devnum = self.inner().map.register_region(node_hint, minors, &name)?;
        let disk = GenDisk::new(name, devnum, minors, flags, ops, Arc::downgrade(self));
        return Ok(disk);
    }

    /// # 注册磁盘
    ///
    /// 使磁盘对外可见、绑定新的序列号，并执行首次分区扫描
    /// （除非该磁盘禁用/抑制了分区扫描）。
    ///
    /// ## 返回值
    ///
    /// 重复注册或设备名冲突时返回`AlreadyRegistered`。
    pub fn add_disk(&self, disk: &Arc<GenDisk>) -> Result<(), BlockError> {
        {
            let mut inner = self.inner();
            if inner.disks.contains_key(disk.name()) {
                return Err(BlockError::AlreadyRegistered);
            }
            disk.inner()
                .set_state(DiskState::Registered)
                .map_err(|_| BlockError::AlreadyRegistered)?;
            inner.disks.insert(disk.name().clone(), disk.clone());
        }
        disk.bind_diskseq(self.next_diskseq());

        // 首次扫描失败不回滚注册：可移动介质设备注册时可能尚无介质
        if let Err(e) = disk.revalidate(false) {
            warn!(
                "gendisk {}: initial partition scan failed: {:?}",
                disk.name(),
                e
            );
        }
        disk.announce(DiskUevent::Add);
        info!("gendisk {}: registered, devnum={:?}", disk.name(), disk.devnum());
        Ok(())
    }

    /// # 注销磁盘
    ///
    /// 标记死亡、撤除可见性并立即返回；不等待既有打开者退出。
    /// 后备状态的回收由最后一次close或最后一次unlink触发，
    /// 两个条件以较晚者为准。
    pub fn del_gendisk(&self, disk: &Arc<GenDisk>) -> Result<(), BlockError> {
        {
            let mut inner = self.inner();
            if inner.disks.remove(disk.name()).is_none() {
                return Err(BlockError::NoSuchDevice);
            }
            if let Err(e) = disk.inner().set_state(DiskState::Dead) {
                error!("gendisk {}: bad state at del_gendisk: {:?}", disk.name(), e);
            }
        }
        disk.announce(DiskUevent::Remove);
        self.try_release(disk);
        Ok(())
    }

    /// 按磁盘名查找（只返回已注册且未注销的磁盘）
    pub fn lookup(&self, name: &str) -> Option<Arc<GenDisk>> {
        let name = DevName::new(name).ok()?;
        self.inner().disks.get(&name).cloned()
    }

    /// 按设备号查找：设备号落在某磁盘的区段内即命中
    pub fn lookup_by_devnum(&self, devnum: DeviceNumber) -> Option<Arc<GenDisk>> {
        let inner = self.inner();
        for disk in inner.disks.values() {
            let base = disk.devnum();
            if base.major() == devnum.major()
                && base.minor() <= devnum.minor()
                && devnum.minor() < base.minor() + disk.minors()
            {
                return Some(disk.clone());
            }
        }
        return None;
    }

    /// 当前所有已注册磁盘的快照，供事件轮询调度器使用
    pub fn disks(&self) -> Vec<Arc<GenDisk>> {
        self.inner().disks.values().cloned().collect()
    }

    /// # 通过路径查找磁盘及分区
    ///
    /// ## 参数
    ///
    /// - `path`: 分区路径 `/dev/sda1` 或者 `sda1`，或者是`/dev/sda`
    pub fn lookup_partition_by_path(&self, path: &str) -> Option<(Arc<GenDisk>, Arc<Partition>)> {
        let raw = path.strip_prefix("/dev/").unwrap_or(path);
        let inner = self.inner();

        // 优先精确匹配整盘设备名，避免把数字结尾设备名（如 loop0）误解析为分区号
        for disk in inner.disks.values() {
            if disk.name().as_str() == raw {
                let part = disk.lookup_partition(0)?;
                return Some((disk.clone(), part));
            }
        }

        // 精确匹配失败后再回退到传统"尾部数字=分区号"解析
        let digits = raw.chars().rev().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 || digits == raw.len() {
            return None;
        }
        let split = raw.len() - digits;
        let partno: u32 = raw[split..].parse().ok()?;
        let devname = &raw[..split];
        for disk in inner.disks.values() {
            if disk.name().as_str() == devname {
                let part = disk.lookup_partition(partno)?;
                return Some((disk.clone(), part));
            }
        }
        return None;
    }

    /// # 建立holder链接：consumer堆叠在provider之上
    ///
    /// 同一对磁盘重复link是no-op成功。链接存在期间provider不会被释放。
    pub fn link_holder(
        &self,
        consumer: &Arc<GenDisk>,
        provider: &Arc<GenDisk>,
    ) -> Result<(), BlockError> {
        // 持管理器锁与try_release互斥，防止在释放判定与建链之间竞争
        let _guard = self.inner();
        return self.holders.link(consumer, provider);
    }

    /// 解除holder链接。provider已注销且无其他引用时，在此完成延迟释放。
    pub fn unlink_holder(&self, consumer: &Arc<GenDisk>, provider: &Arc<GenDisk>) {
        if !self.holders.unlink(consumer, provider) {
            return;
        }
        self.try_release(provider);
    }

    /// 枚举建立在provider之上的consumer磁盘
    pub fn holders_of(&self, provider: &Arc<GenDisk>) -> Vec<Arc<GenDisk>> {
        self.holders.holders_of(provider)
    }

    /// 枚举consumer所消费的provider磁盘
    pub fn providers_of(&self, consumer: &Arc<GenDisk>) -> Vec<Arc<GenDisk>> {
        self.holders.providers_of(consumer)
    }

    /// # 尝试回收磁盘的后备状态
    ///
    /// 打开计数为0、已标记死亡且无holder时，状态转入Released、
    /// 归还设备号区段并清空分区表。时机由引用计数确定性地驱动，
    /// 不依赖隐式回收。
    pub(crate) fn try_release(&self, disk: &Arc<GenDisk>) -> bool {
        {
            let mut inner = self.inner();
            {
                let mut disk_inner = disk.inner();
                if disk_inner.state != DiskState::Dead || disk_inner.open_count != 0 {
                    return false;
                }
                if self.holders.holder_count(disk) > 0 {
                    // dead-pending-release：对注销者不可见的内部延迟
                    return false;
                }
                if disk_inner.set_state(DiskState::Released).is_err() {
                    return false;
                }
            }
            if let Err(e) = inner.map.unregister_region(disk.devnum(), disk.minors()) {
                error!(
                    "gendisk {}: node region release failed: {:?}",
                    disk.name(),
                    e
                );
            }
        }
        disk.part_tbl.write().drop_all();
        info!("gendisk {}: released", disk.name());
        return true;
    }

    /// 从未注册过的磁盘在Drop时归还设备号区段
    pub(crate) fn release_region(&self, devnum: DeviceNumber, minors: u32) {
        let _ = self.inner().map.unregister_region(devnum, minors);
    }
}

impl core::fmt::Debug for BlockDevManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockDevManager")
            .field("disks", &self.inner().disks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::{BlockId, GeneralBlockRange, SectorT, LBA_SIZE};
    use crate::error::BlockError;
    use crate::events::{DiskEventFlags, DiskEventKind, EventPoller};
    use crate::gendisk::{BadBlocks, BlkIntegrity, GdStateFlags};
    use crate::mbr;
    use alloc::string::String;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// 测试用的驱动替身
    #[derive(Debug)]
    struct FakeDrive {
        state: Mutex<FakeDriveState>,
    }

    #[derive(Debug)]
    struct FakeDriveState {
        capacity: SectorT,
        sector0: Vec<u8>,
        probe_error: bool,
        read_error: bool,
        pending: DiskEventKind,
        event_flags: DiskEventFlags,
    }

    impl FakeDrive {
        fn new(capacity: SectorT) -> Arc<Self> {
            Arc::new(FakeDrive {
                state: Mutex::new(FakeDriveState {
                    capacity,
                    sector0: Vec::new(),
                    probe_error: false,
                    read_error: false,
                    pending: DiskEventKind::empty(),
                    event_flags: DiskEventFlags::UEVENT | DiskEventFlags::BLOCK_ON_EXCL_WRITE,
                }),
            })
        }

        fn set_capacity(&self, capacity: SectorT) {
            self.state.lock().capacity = capacity;
        }

        fn set_sector0(&self, sector0: Vec<u8>) {
            self.state.lock().sector0 = sector0;
        }

        fn set_probe_error(&self, fail: bool) {
            self.state.lock().probe_error = fail;
        }

        fn set_read_error(&self, fail: bool) {
            self.state.lock().read_error = fail;
        }

        fn push_event(&self, kind: DiskEventKind) {
            self.state.lock().pending |= kind;
        }
    }

    impl BlockDevice for FakeDrive {
        fn probe_capacity(&self) -> Result<SectorT, BlockError> {
            let state = self.state.lock();
            if state.probe_error {
                return Err(BlockError::MediaProbeFailed);
            }
            return Ok(state.capacity);
        }

        fn read_at_sync(
            &self,
            lba_id_start: BlockId,
            _count: usize,
            buf: &mut [u8],
        ) -> Result<usize, BlockError> {
            let state = self.state.lock();
            if state.read_error {
                return Err(BlockError::MediaProbeFailed);
            }
            assert_eq!(lba_id_start, 0);
            buf.fill(0);
            let n = core::cmp::min(buf.len(), state.sector0.len());
            buf[..n].copy_from_slice(&state.sector0[..n]);
            return Ok(LBA_SIZE);
        }

        fn check_events(&self, clearing: DiskEventKind) -> DiskEventKind {
            let mut state = self.state.lock();
            let fired = state.pending & clearing;
            state.pending &= !clearing;
            return fired;
        }

        fn supported_events(&self) -> DiskEventKind {
            DiskEventKind::MEDIA_CHANGE | DiskEventKind::EJECT_REQUEST
        }

        fn event_flags(&self) -> DiskEventFlags {
            self.state.lock().event_flags
        }
    }

    /// 记录所有announce调用的通知替身
    struct RecordingNotifier {
        events: Mutex<Vec<(String, DiskUevent)>>,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(RecordingNotifier {
                events: Mutex::new(Vec::new()),
            })
        }

        fn count(&self, kind: DiskUevent) -> usize {
            self.events.lock().iter().filter(|(_, k)| *k == kind).count()
        }

        fn clear(&self) {
            self.events.lock().clear();
        }
    }

    impl DiskNotifier for RecordingNotifier {
        fn announce(&self, disk: &Arc<GenDisk>, event: DiskUevent) {
            self.events
                .lock()
                .push((String::from(disk.name().as_str()), event));
        }
    }

    fn setup() -> (Arc<BlockDevManager>, Arc<RecordingNotifier>) {
        let notifier = RecordingNotifier::new();
        let manager = BlockDevManager::new(notifier.clone());
        return (manager, notifier);
    }

    fn register_disk(
        manager: &Arc<BlockDevManager>,
        name: &str,
        drive: &Arc<FakeDrive>,
        flags: GenDiskFlags,
    ) -> Arc<GenDisk> {
        let disk = manager
            .alloc_disk(name, drive.clone(), DeviceNumber::default(), 16, flags)
            .unwrap();
        manager.add_disk(&disk).unwrap();
        return disk;
    }

    #[test]
    fn test_register_and_first_scan() {
        let (manager, notifier) = setup();
        let drive = FakeDrive::new(8192);
        drive.set_sector0(mbr::build_sector(&[(2048, 4096), (6144, 1024)]));
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());

        assert_eq!(disk.state(), DiskState::Registered);
        assert_eq!(disk.capacity(), 8192);
        assert!(disk.diskseq() > 0);
        assert_eq!(notifier.count(DiskUevent::Add), 1);

        let parts = disk.partitions();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].partno(), 0);
        assert_eq!(parts[1].start_sector(), 2048);
        assert_eq!(parts[1].sectors(), 4096);
        assert_eq!(parts[2].start_sector(), 6144);

        assert!(manager.lookup("sda").is_some());
        assert!(manager.lookup("sdb").is_none());
        assert!(manager.lookup_by_devnum(disk.devnum()).is_some());
    }

    #[test]
    fn test_duplicate_register() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(1024);
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        assert_eq!(manager.add_disk(&disk), Err(BlockError::AlreadyRegistered));

        // 同名的另一块磁盘同样被拒绝
        let other = manager
            .alloc_disk("sda", drive.clone(), DeviceNumber::default(), 16, GenDiskFlags::empty())
            .unwrap();
        assert_eq!(manager.add_disk(&other), Err(BlockError::AlreadyRegistered));
    }

    #[test]
    fn test_open_close_and_release() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        let devnum = disk.devnum();

        let handle = disk.open(0, false).unwrap();
        assert_eq!(disk.open_count(), 1);

        // 注销不等待打开者：立即返回，lookup随即失效
        manager.del_gendisk(&disk).unwrap();
        assert_eq!(disk.state(), DiskState::Dead);
        assert!(manager.lookup("sda").is_none());

        // 注销后新的打开被拒绝
        assert_eq!(disk.open(0, false).unwrap_err(), BlockError::NoSuchDevice);

        // 既有句柄的close永远不会被先行的注销阻塞
        handle.close();
        assert_eq!(disk.open_count(), 0);
        assert_eq!(disk.state(), DiskState::Released);

        // 设备号区段已归还，可再次注册
        let drive2 = FakeDrive::new(4096);
        let disk2 = manager
            .alloc_disk("sda", drive2.clone(), devnum, 16, GenDiskFlags::empty())
            .unwrap();
        manager.add_disk(&disk2).unwrap();
    }

    #[test]
    fn test_read_only_arbitration() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());

        // 先拿到一个写句柄
        let writer = disk.open(0, true).unwrap();
        assert_eq!(disk.open_count(), 1);

        disk.set_read_only(true);
        // 新的写打开立即失败，且不增加打开计数
        assert_eq!(disk.open(0, true).unwrap_err(), BlockError::ReadOnlyViolation);
        assert_eq!(disk.open_count(), 1);
        // 读打开不受影响
        let reader = disk.open(0, false).unwrap();

        // 既有写句柄不被撤销（保留的兼容策略）
        assert!(!writer.is_stale());
        writer.close();
        reader.close();
        assert_eq!(disk.open_count(), 0);

        disk.set_read_only(false);
        assert!(disk.open(0, true).is_ok());
    }

    #[test]
    fn test_set_capacity_and_notify() {
        let (manager, notifier) = setup();
        let drive = FakeDrive::new(0);
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        notifier.clear();

        assert!(disk.set_capacity_and_notify(2048));
        assert_eq!(notifier.count(DiskUevent::Resize), 1);
        // 相同的值不触发通知
        assert!(!disk.set_capacity_and_notify(2048));
        assert_eq!(notifier.count(DiskUevent::Resize), 1);
    }

    #[test]
    fn test_revalidate_probe_failure_preserves_table() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(8192);
        drive.set_sector0(mbr::build_sector(&[(2048, 4096)]));
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        assert!(disk.lookup_partition(1).is_some());

        drive.set_probe_error(true);
        assert_eq!(
            disk.revalidate(true).unwrap_err(),
            BlockError::MediaProbeFailed
        );
        // 瞬时I/O错误不得清空分区表或容量
        assert_eq!(disk.lookup_partition(0).unwrap().sectors(), 8192);
        assert!(disk.lookup_partition(1).is_some());
        // 扫描结束后事件轮询已恢复
        assert!(!disk.events().blocked());

        // 分区表扇区读取失败同样保留旧表
        drive.set_probe_error(false);
        drive.set_read_error(true);
        assert_eq!(
            disk.revalidate(true).unwrap_err(),
            BlockError::MediaProbeFailed
        );
        assert!(disk.lookup_partition(1).is_some());
    }

    /// 容量0起步，set_capacity后两分区扫描，重复重验不再报告变化
    #[test]
    fn test_capacity_then_two_partition_scan() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(0);
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        assert_eq!(disk.capacity(), 0);

        assert!(disk.set_capacity(2048));

        drive.set_capacity(2048);
        drive.set_sector0(mbr::build_sector(&[(0, 1024), (1024, 1024)]));
        assert!(disk.revalidate(false).unwrap());

        let p1 = disk.lookup_partition(1).unwrap();
        assert_eq!(p1.start_sector(), 0);
        assert_eq!(p1.sectors(), 1024);
        let p2 = disk.lookup_partition(2).unwrap();
        assert_eq!(p2.start_sector(), 1024);
        assert_eq!(p2.sectors(), 1024);

        // 相同的布局：没有变化
        assert!(!disk.revalidate(false).unwrap());
    }

    #[test]
    fn test_oversized_entries_truncated() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        // 第2项越界截断，第3项整体在容量之外被丢弃
        drive.set_sector0(mbr::build_sector(&[(0, 2048), (2048, 8192), (100000, 16)]));
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());

        assert_eq!(disk.lookup_partition(1).unwrap().sectors(), 2048);
        let p2 = disk.lookup_partition(2).unwrap();
        assert_eq!(p2.sectors(), 4096 - 2048);
        assert!(disk.lookup_partition(3).is_none());
    }

    #[test]
    fn test_overlapping_entries_dropped() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(8192);
        drive.set_sector0(mbr::build_sector(&[(0, 2048), (1024, 2048)]));
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());

        assert!(disk.lookup_partition(1).is_some());
        // 与第1项重叠的表项被丢弃
        assert!(disk.lookup_partition(2).is_none());
    }

    #[test]
    fn test_invalidate_on_zero_capacity() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(8192);
        drive.set_sector0(mbr::build_sector(&[(2048, 4096)]));
        let disk = register_disk(&manager, "cdrom", &drive, GenDiskFlags::REMOVABLE);
        assert!(disk.state_bits().contains(GdStateFlags::NATIVE_CAPACITY));

        // 介质被拔出：探测容量为0
        drive.set_capacity(0);
        assert!(disk.revalidate(true).unwrap());
        assert_eq!(disk.capacity(), 0);
        assert!(disk.lookup_partition(1).is_none());
        assert!(disk.lookup_partition(0).is_some());
        assert!(!disk.state_bits().contains(GdStateFlags::NATIVE_CAPACITY));

        drive.set_capacity(8192);
        assert!(disk.revalidate(false).unwrap());
        assert!(disk.lookup_partition(1).is_some());
        assert!(disk.state_bits().contains(GdStateFlags::NATIVE_CAPACITY));

        // invalidate=false时容量照常归零，空介质的扫描得到空布局，
        // 但不声称探测到了本征容量
        drive.set_capacity(0);
        drive.set_sector0(Vec::new());
        assert!(disk.revalidate(false).unwrap());
        assert_eq!(disk.capacity(), 0);
        assert!(disk.lookup_partition(1).is_none());
        assert!(!disk.state_bits().contains(GdStateFlags::NATIVE_CAPACITY));
    }

    #[test]
    fn test_no_part_flag_skips_scan() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        // 读取路径故障：若扫描被执行，注册时就会出错
        drive.set_read_error(true);
        let disk = register_disk(&manager, "vda", &drive, GenDiskFlags::NO_PART);
        assert_eq!(disk.capacity(), 4096);
        assert_eq!(disk.partitions().len(), 1);
    }

    #[test]
    fn test_suppress_part_scan() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        drive.set_sector0(mbr::build_sector(&[(0, 2048)]));
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        assert!(disk.lookup_partition(1).is_some());

        disk.set_suppress_partition_scan(true);
        assert!(disk.revalidate(false).unwrap());
        // 抑制期间扫描结果为空表
        assert!(disk.lookup_partition(1).is_none());

        disk.set_suppress_partition_scan(false);
        assert!(disk.revalidate(false).unwrap());
        assert!(disk.lookup_partition(1).is_some());
    }

    #[test]
    fn test_hidden_disk_produces_no_uevent() {
        let (manager, notifier) = setup();
        let drive = FakeDrive::new(4096);
        let disk = register_disk(&manager, "dm-0", &drive, GenDiskFlags::HIDDEN);
        assert_eq!(notifier.count(DiskUevent::Add), 0);
        manager.del_gendisk(&disk).unwrap();
        assert_eq!(notifier.count(DiskUevent::Remove), 0);
    }

    #[test]
    fn test_diskseq_across_reregister_cycle() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        let node = DeviceNumber::new(crate::device_number::Major::SCSI_DISK0_MAJOR, 0);

        let disk = manager
            .alloc_disk("sda", drive.clone(), node, 16, GenDiskFlags::empty())
            .unwrap();
        manager.add_disk(&disk).unwrap();
        let handle = disk.open(0, false).unwrap();
        let old_seq = handle.diskseq();

        manager.del_gendisk(&disk).unwrap();
        handle.close();
        assert_eq!(disk.state(), DiskState::Released);

        // 同一设备号区段上的新磁盘：序列号严格递增
        let disk2 = manager
            .alloc_disk("sda", drive.clone(), node, 16, GenDiskFlags::empty())
            .unwrap();
        manager.add_disk(&disk2).unwrap();
        assert_eq!(disk2.devnum(), node);
        assert!(disk2.diskseq() > old_seq);
    }

    #[test]
    fn test_media_change_revalidates_and_bumps_seq() {
        let (manager, notifier) = setup();
        let drive = FakeDrive::new(4096);
        drive.set_sector0(mbr::build_sector(&[(0, 4096)]));
        let disk = register_disk(&manager, "cdrom", &drive, GenDiskFlags::REMOVABLE);
        let handle = disk.open(0, false).unwrap();
        assert!(!handle.is_stale());
        notifier.clear();

        // 换上一张布局不同的新介质
        drive.set_capacity(8192);
        drive.set_sector0(mbr::build_sector(&[(0, 2048), (2048, 6144)]));
        drive.push_event(DiskEventKind::MEDIA_CHANGE);

        let fired = disk.check_events();
        assert!(fired.contains(DiskEventKind::MEDIA_CHANGE));
        assert_eq!(disk.capacity(), 8192);
        assert!(disk.lookup_partition(2).is_some());
        assert_eq!(notifier.count(DiskUevent::MediaChange), 1);
        // 介质身份变化：旧句柄失效
        assert!(handle.is_stale());
    }

    #[test]
    fn test_eject_request_is_advisory() {
        let (manager, notifier) = setup();
        let drive = FakeDrive::new(4096);
        drive.set_sector0(mbr::build_sector(&[(0, 4096)]));
        let disk = register_disk(&manager, "cdrom", &drive, GenDiskFlags::REMOVABLE);
        notifier.clear();

        // 弹出请求只转发，不触发重验：故障的读取路径不会被触碰
        drive.set_read_error(true);
        drive.push_event(DiskEventKind::EJECT_REQUEST);
        let fired = disk.check_events();
        assert_eq!(fired, DiskEventKind::EJECT_REQUEST);
        assert_eq!(notifier.count(DiskUevent::Eject), 1);
        assert_eq!(notifier.count(DiskUevent::MediaChange), 0);
        assert!(disk.lookup_partition(1).is_some());
    }

    #[test]
    fn test_force_media_change() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        let seq = disk.diskseq();

        assert!(disk.force_media_change());
        assert!(disk.diskseq() > seq);

        // 事件被block时注入保持pending，解除后由下一次poll消费
        disk.events().block();
        assert!(!disk.force_media_change());
        disk.events().unblock();
        assert!(disk.check_events().contains(DiskEventKind::MEDIA_CHANGE));
    }

    #[test]
    fn test_poller_respects_block_and_interval() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        disk.events().set_poll_msecs(1000);
        let poller = EventPoller::new(manager.clone());

        assert_eq!(poller.tick(1000), 1);
        // 间隔未到
        assert_eq!(poller.tick(1500), 0);

        // 3层block需要3次unblock才恢复轮询
        disk.events().block();
        disk.events().block();
        disk.events().block();
        assert_eq!(poller.tick(3000), 0);
        disk.events().unblock();
        disk.events().unblock();
        assert_eq!(poller.tick(4000), 0);
        disk.events().unblock();
        assert_eq!(poller.tick(5000), 1);
    }

    #[test]
    fn test_poller_suppressed_by_exclusive_write() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        disk.events().set_poll_msecs(1000);
        let poller = EventPoller::new(manager.clone());

        let writer = disk.open(0, true).unwrap();
        // 写密集负载保护：独占写打开期间不轮询
        assert_eq!(poller.tick(2000), 0);
        writer.close();
        assert_eq!(poller.tick(4000), 1);
    }

    #[test]
    fn test_holder_defers_release() {
        let (manager, _) = setup();
        let lower_drive = FakeDrive::new(8192);
        lower_drive.set_sector0(mbr::build_sector(&[(0, 8192)]));
        let upper_drive = FakeDrive::new(8192);

        let lower = register_disk(&manager, "sda", &lower_drive, GenDiskFlags::empty());
        let upper = register_disk(&manager, "dm-0", &upper_drive, GenDiskFlags::NO_PART);

        manager.link_holder(&upper, &lower).unwrap();
        // 重复link是no-op成功
        manager.link_holder(&upper, &lower).unwrap();
        assert_eq!(manager.holders_of(&lower).len(), 1);
        assert_eq!(manager.providers_of(&upper).len(), 1);

        // 注销provider：死亡但后备状态保留
        manager.del_gendisk(&lower).unwrap();
        assert_eq!(lower.state(), DiskState::Dead);
        assert!(lower.lookup_partition(0).is_some());
        assert!(lower.lookup_partition(1).is_some());

        // 最后一个holder解除后才真正释放
        manager.unlink_holder(&upper, &lower);
        assert_eq!(lower.state(), DiskState::Released);
        assert!(manager.holders_of(&lower).is_empty());

        // 已释放的磁盘不能再被claim
        assert_eq!(
            manager.link_holder(&upper, &lower),
            Err(BlockError::NoSuchDevice)
        );
    }

    #[test]
    fn test_release_waits_for_both_openers_and_holders() {
        let (manager, _) = setup();
        let lower_drive = FakeDrive::new(4096);
        let upper_drive = FakeDrive::new(4096);
        let lower = register_disk(&manager, "sda", &lower_drive, GenDiskFlags::empty());
        let upper = register_disk(&manager, "dm-0", &upper_drive, GenDiskFlags::NO_PART);

        let handle = lower.open(0, false).unwrap();
        manager.link_holder(&upper, &lower).unwrap();
        manager.del_gendisk(&lower).unwrap();

        // 先解链：仍有打开者，不释放
        manager.unlink_holder(&upper, &lower);
        assert_eq!(lower.state(), DiskState::Dead);
        // 最后一次close完成释放
        handle.close();
        assert_eq!(lower.state(), DiskState::Released);
    }

    /// 设备名跨注销/重注册复用时，两代磁盘的holder链接互不混淆
    #[test]
    fn test_holder_links_survive_name_reuse() {
        let (manager, _) = setup();
        let old_drive = FakeDrive::new(4096);
        let upper_drive = FakeDrive::new(4096);
        let lower_old = register_disk(&manager, "sda", &old_drive, GenDiskFlags::empty());
        let upper = register_disk(&manager, "dm-0", &upper_drive, GenDiskFlags::NO_PART);

        manager.link_holder(&upper, &lower_old).unwrap();
        manager.del_gendisk(&lower_old).unwrap();
        assert_eq!(lower_old.state(), DiskState::Dead);

        // 同名的新一代磁盘注册并被claim
        let new_drive = FakeDrive::new(4096);
        let lower_new = register_disk(&manager, "sda", &new_drive, GenDiskFlags::empty());
        manager.link_holder(&upper, &lower_new).unwrap();
        assert_eq!(manager.holders_of(&lower_new).len(), 1);
        assert_eq!(manager.providers_of(&upper).len(), 2);

        // 解除对旧一代的claim只释放旧磁盘，新磁盘的链接不受影响
        manager.unlink_holder(&upper, &lower_old);
        assert_eq!(lower_old.state(), DiskState::Released);
        assert_eq!(manager.holders_of(&lower_new).len(), 1);

        // 新磁盘注销后仍被claim：释放推迟到它自己的unlink
        manager.del_gendisk(&lower_new).unwrap();
        assert_eq!(lower_new.state(), DiskState::Dead);
        manager.unlink_holder(&upper, &lower_new);
        assert_eq!(lower_new.state(), DiskState::Released);
    }

    #[test]
    fn test_optional_disk_metadata() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        assert!(disk.bad_blocks().is_none());
        assert!(disk.integrity().is_none());

        let bb = BadBlocks::new(vec![GeneralBlockRange::new(100, 200).unwrap()]);
        disk.set_bad_blocks(Some(Arc::new(bb)));
        let bb = disk.bad_blocks().unwrap();
        assert!(bb.contains(100));
        assert!(bb.contains(199));
        assert!(!bb.contains(200));
        assert!(!bb.contains(99));

        let profile = BlkIntegrity {
            flags: 0,
            tuple_size: 8,
            interval_exp: 0,
            tag_size: 2,
        };
        disk.set_integrity(Some(profile));
        assert_eq!(disk.integrity(), Some(profile));
        disk.set_integrity(None);
        assert!(disk.integrity().is_none());
    }

    #[test]
    fn test_flush_events_mask() {
        let (manager, notifier) = setup();
        let drive = FakeDrive::new(4096);
        drive.set_sector0(mbr::build_sector(&[(0, 4096)]));
        let disk = register_disk(&manager, "cdrom", &drive, GenDiskFlags::REMOVABLE);
        notifier.clear();

        drive.push_event(DiskEventKind::MEDIA_CHANGE | DiskEventKind::EJECT_REQUEST);
        // 只冲刷弹出请求：介质更换留在驱动侧挂起
        let fired = disk.flush_events(DiskEventKind::EJECT_REQUEST);
        assert_eq!(fired, DiskEventKind::EJECT_REQUEST);
        assert_eq!(notifier.count(DiskUevent::Eject), 1);
        assert_eq!(notifier.count(DiskUevent::MediaChange), 0);

        // pending注入同样只按mask消费
        disk.events().inject(DiskEventKind::MEDIA_CHANGE);
        assert_eq!(
            disk.flush_events(DiskEventKind::EJECT_REQUEST),
            DiskEventKind::empty()
        );

        // 下一次完整检查消费剩余的介质更换事件
        assert!(disk.check_events().contains(DiskEventKind::MEDIA_CHANGE));
        assert_eq!(notifier.count(DiskUevent::MediaChange), 1);
    }

    #[test]
    fn test_lookup_partition_by_path() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(8192);
        drive.set_sector0(mbr::build_sector(&[(0, 4096), (4096, 4096)]));
        register_disk(&manager, "sda", &drive, GenDiskFlags::empty());
        // 数字结尾的整盘设备名
        let loop_drive = FakeDrive::new(1024);
        register_disk(&manager, "loop0", &loop_drive, GenDiskFlags::NO_PART);

        let (disk, part) = manager.lookup_partition_by_path("/dev/sda2").unwrap();
        assert_eq!(disk.name().as_str(), "sda");
        assert_eq!(part.partno(), 2);

        let (_, part0) = manager.lookup_partition_by_path("sda").unwrap();
        assert_eq!(part0.partno(), 0);

        // 整盘名精确匹配优先于"尾部数字=分区号"解析
        let (loop_disk, loop_part) = manager.lookup_partition_by_path("/dev/loop0").unwrap();
        assert_eq!(loop_disk.name().as_str(), "loop0");
        assert_eq!(loop_part.partno(), 0);

        assert!(manager.lookup_partition_by_path("/dev/sdb1").is_none());
        assert!(manager.lookup_partition_by_path("/dev/sda9").is_none());
    }

    #[test]
    fn test_alloc_without_register_frees_region() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(4096);
        let node = DeviceNumber::new(crate::device_number::Major::SCSI_DISK0_MAJOR, 0);

        let disk = manager
            .alloc_disk("sda", drive.clone(), node, 16, GenDiskFlags::empty())
            .unwrap();
        // 同一区段在占用期间不可重复分配
        assert_eq!(
            manager
                .alloc_disk("sdb", drive.clone(), node, 16, GenDiskFlags::empty())
                .unwrap_err(),
            BlockError::NodeBusy
        );
        drop(disk);
        // 从未注册的磁盘Drop时归还区段
        assert!(manager
            .alloc_disk("sdb", drive.clone(), node, 16, GenDiskFlags::empty())
            .is_ok());
    }

    /// 并发读者只能观察到完整的旧表或完整的新表，不存在混合窗口
    #[test]
    fn test_partition_table_visibility_is_atomic() {
        let (manager, _) = setup();
        let drive = FakeDrive::new(8192);
        let layout_a = mbr::build_sector(&[(0, 2048), (2048, 2048)]);
        let layout_b = mbr::build_sector(&[(0, 4096)]);
        drive.set_sector0(layout_a.clone());
        let disk = register_disk(&manager, "sda", &drive, GenDiskFlags::empty());

        let reader_disk = disk.clone();
        let reader = std::thread::spawn(move || {
            for _ in 0..2000 {
                let parts: Vec<(u32, u64)> = reader_disk
                    .partitions()
                    .iter()
                    .filter(|p| p.partno() != 0)
                    .map(|p| (p.partno(), p.sectors()))
                    .collect();
                let is_a = parts == vec![(1, 2048), (2, 2048)];
                let is_b = parts == vec![(1, 4096)];
                assert!(is_a || is_b, "mixed partition table observed: {:?}", parts);
            }
        });

        for i in 0..200 {
            if i % 2 == 0 {
                drive.set_sector0(layout_b.clone());
            } else {
                drive.set_sector0(layout_a.clone());
            }
            disk.revalidate(false).unwrap();
        }
        reader.join().unwrap();
    }
}
