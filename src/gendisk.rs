use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt::{Debug, Formatter};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use log::{info, warn};
use spin::{Mutex, MutexGuard, RwLock};

use crate::block_device::{BlockDevice, DevName, DiskUevent, GeneralBlockRange, SectorT};
use crate::device_number::DeviceNumber;
use crate::error::BlockError;
use crate::events::{DiskEventFlags, DiskEventKind, DiskEvents};
use crate::manager::BlockDevManager;
use crate::partition::{PartTable, Partition};

bitflags! {
    /// 磁盘的能力标志，创建后不再改变
    pub struct GenDiskFlags: u32 {
        /// 可移动介质设备：介质拔出后设备本身仍然存在
        const REMOVABLE = 1 << 0;
        /// 对用户态发现层隐藏，不产生事件通知。多路径设备的底层成员使用
        const HIDDEN = 1 << 1;
        /// 禁用分区扫描
        const NO_PART = 1 << 2;
    }
}

bitflags! {
    /// 磁盘的可变状态位，无锁访问（只需要幂等语义）
    pub struct GdStateFlags: u32 {
        const NEED_PART_SCAN = 1 << 0;
        const READ_ONLY = 1 << 1;
        /// 最近一次探测得到了有效的本征容量
        const NATIVE_CAPACITY = 1 << 2;
        /// 临时抑制分区扫描
        const SUPPRESS_PART_SCAN = 1 << 3;
    }
}

/// @brief 坏块表：驱动声明的不可用扇区范围
///
/// 本层只保存与查询；重定向或修复策略由驱动自己实现。
#[derive(Debug, Clone, Default)]
pub struct BadBlocks {
    ranges: Vec<GeneralBlockRange>,
}

impl BadBlocks {
    pub fn new(ranges: Vec<GeneralBlockRange>) -> Self {
        BadBlocks { ranges }
    }

    pub fn contains(&self, sector: SectorT) -> bool {
        self.ranges
            .iter()
            .any(|r| r.lba_start as u64 <= sector && sector < r.lba_end as u64)
    }

    pub fn ranges(&self) -> &[GeneralBlockRange] {
        &self.ranges
    }
}

/// 数据完整性（DIF/DIX）配置的描述元数据。
/// 校验的生成与验证在驱动/上层完成，本层只携带配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkIntegrity {
    pub flags: u8,
    pub tuple_size: u8,
    /// 保护间隔大小 = 逻辑块大小 << interval_exp
    pub interval_exp: u8,
    pub tag_size: u8,
}

/// 磁盘的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    /// 已分配设备号区段，但对外不可见
    Allocated,
    /// 对外可见，接受打开请求
    Registered,
    /// 已注销：拒绝新的打开，既有打开者与holder继续存活
    Dead,
    /// 引用计数归零且无holder后，后备状态已回收
    Released,
}

pub(crate) struct InnerGenDisk {
    pub(crate) state: DiskState,
    pub(crate) open_count: u32,
    pub(crate) write_opens: u32,
}

impl InnerGenDisk {
    /// 检查状态转换是否有效并执行转换
    ///
    /// 注意：调用者必须持有 InnerGenDisk 的锁
    pub(crate) fn set_state(&mut self, new_state: DiskState) -> Result<(), BlockError> {
        const VALID_TRANSITIONS: &[(DiskState, DiskState)] = &[
            (DiskState::Allocated, DiskState::Registered),
            // 驱动探测中途放弃，从未注册就进入销毁
            (DiskState::Allocated, DiskState::Dead),
            (DiskState::Registered, DiskState::Dead),
            (DiskState::Dead, DiskState::Released),
        ];
        if !VALID_TRANSITIONS.contains(&(self.state, new_state)) {
            return Err(BlockError::InvalidArgument);
        }
        self.state = new_state;
        Ok(())
    }
}

/// @brief 通用磁盘对象
///
/// 代表一个物理/逻辑存储设备的内存身份：名字、设备号区段、能力/状态位、
/// 序列号、打开计数与分区表。驱动通过`BlockDevManager::alloc_disk`创建，
/// `add_disk`注册后对外可见。
pub struct GenDisk {
    name: DevName,
    devnum: DeviceNumber,
    minors: u32,
    flags: GenDiskFlags,
    gd_state: AtomicU32,
    /// 磁盘身份每次与物理介质绑定（注册、介质更换）时递增。
    /// 跨注销/重注册周期缓存的引用通过比较序列号检测失效。
    diskseq: AtomicU64,
    pub(crate) inner: Mutex<InnerGenDisk>,
    /// 可选的坏块表与完整性配置，驱动在alloc与register之间按需安装
    bad_blocks: Mutex<Option<Arc<BadBlocks>>>,
    integrity: Mutex<Option<BlkIntegrity>>,
    pub(crate) part_tbl: RwLock<PartTable>,
    part0: Arc<Partition>,
    pub(crate) events: DiskEvents,
    pub(crate) ops: Arc<dyn BlockDevice>,
    pub(crate) manager: Weak<BlockDevManager>,
    pub(crate) self_ref: Weak<GenDisk>,
}

impl GenDisk {
    pub(crate) fn new(
        name: DevName,
        devnum: DeviceNumber,
        minors: u32,
        flags: GenDiskFlags,
        ops: Arc<dyn BlockDevice>,
        manager: Weak<BlockDevManager>,
    ) -> Arc<Self> {
        let events = DiskEvents::new(ops.supported_events(), ops.event_flags());
        return Arc::new_cyclic(|me: &Weak<GenDisk>| {
            let part0 = Partition::new(0, 0, 0, None, me.clone());
            GenDisk {
                name,
                devnum,
                minors,
                flags,
                gd_state: AtomicU32::new(0),
                diskseq: AtomicU64::new(0),
                inner: Mutex::new(InnerGenDisk {
                    state: DiskState::Allocated,
                    open_count: 0,
                    write_opens: 0,
                }),
                bad_blocks: Mutex::new(None),
                integrity: Mutex::new(None),
                part_tbl: RwLock::new(PartTable::new(part0.clone())),
                part0,
                events,
                ops,
                manager,
                self_ref: me.clone(),
            }
        });
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, InnerGenDisk> {
        self.inner.lock()
    }

    #[inline]
    pub fn name(&self) -> &DevName {
        &self.name
    }

    #[inline]
    pub fn devnum(&self) -> DeviceNumber {
        self.devnum
    }

    #[inline]
    pub fn minors(&self) -> u32 {
        self.minors
    }

    #[inline]
    pub fn flags(&self) -> GenDiskFlags {
        self.flags
    }

    #[inline]
    pub fn events(&self) -> &DiskEvents {
        &self.events
    }

    pub fn state(&self) -> DiskState {
        self.inner().state
    }

    /// 磁盘是否已注册且存活
    pub fn disk_live(&self) -> bool {
        self.inner().state == DiskState::Registered
    }

    pub fn state_bits(&self) -> GdStateFlags {
        GdStateFlags::from_bits_truncate(self.gd_state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state_bits(&self, bits: GdStateFlags) {
        self.gd_state.fetch_or(bits.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_state_bits(&self, bits: GdStateFlags) {
        self.gd_state.fetch_and(!bits.bits(), Ordering::SeqCst);
    }

    #[inline]
    pub fn diskseq(&self) -> u64 {
        self.diskseq.load(Ordering::SeqCst)
    }

    /// 介质身份重新绑定时由管理器调用
    pub(crate) fn bind_diskseq(&self, seq: u64) {
        self.diskseq.store(seq, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u32 {
        self.inner().open_count
    }

    pub(crate) fn excl_write_open(&self) -> bool {
        self.inner().write_opens > 0
    }

    /// 磁盘当前容量（0号分区的扇区数）
    pub fn capacity(&self) -> SectorT {
        self.part0.sectors()
    }

    /// # 更新磁盘容量
    ///
    /// ## 返回值
    ///
    /// 新值与旧值不同时返回true，调用者据此决定是否发出resize通知。
    pub fn set_capacity(&self, sectors: SectorT) -> bool {
        return self.part0.set_sectors(sectors) != sectors;
    }

    /// 更新容量，发生变化且磁盘存活时向外部通知层发出Resize
    pub fn set_capacity_and_notify(self: &Arc<Self>, sectors: SectorT) -> bool {
        let changed = self.set_capacity(sectors);
        if changed && self.disk_live() {
            self.announce(DiskUevent::Resize);
        }
        return changed;
    }

    pub fn get_read_only(&self) -> bool {
        self.state_bits().contains(GdStateFlags::READ_ONLY)
    }

    /// # 设置/清除磁盘只读位
    ///
    /// 对后续的打开立即生效。已经打开的写句柄不被撤销，继续有效直到关闭：
    /// 这是从源头保留下来的兼容策略，不要"修复"。
    pub fn set_read_only(&self, read_only: bool) {
        if read_only {
            self.set_state_bits(GdStateFlags::READ_ONLY);
        } else {
            self.clear_state_bits(GdStateFlags::READ_ONLY);
        }
    }

    /// 临时抑制/恢复分区扫描
    pub fn set_suppress_partition_scan(&self, suppress: bool) {
        if suppress {
            self.set_state_bits(GdStateFlags::SUPPRESS_PART_SCAN);
        } else {
            self.clear_state_bits(GdStateFlags::SUPPRESS_PART_SCAN);
        }
    }

    pub fn bad_blocks(&self) -> Option<Arc<BadBlocks>> {
        self.bad_blocks.lock().clone()
    }

    pub fn set_bad_blocks(&self, bb: Option<Arc<BadBlocks>>) {
        *self.bad_blocks.lock() = bb;
    }

    pub fn integrity(&self) -> Option<BlkIntegrity> {
        *self.integrity.lock()
    }

    pub fn set_integrity(&self, profile: Option<BlkIntegrity>) {
        *self.integrity.lock() = profile;
    }

    pub fn lookup_partition(&self, partno: u32) -> Option<Arc<Partition>> {
        self.part_tbl.read().lookup(partno)
    }

    /// 按分区号升序返回当前所有分区的Arc指针数组
    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.part_tbl.read().values_sorted()
    }

    /// # 打开磁盘或其某个分区
    ///
    /// 互斥锁只覆盖计数与死亡检查，不跨越任何I/O。
    ///
    /// ## 返回值
    ///
    /// - `Err(NoSuchDevice)`: 磁盘未注册/已注销，或分区号不存在
    /// - `Err(ReadOnlyViolation)`: 以写方式打开只读磁盘/分区，打开计数不变
    pub fn open(self: &Arc<Self>, partno: u32, for_write: bool) -> Result<BlockDevHandle, BlockError> {
        let part = self
            .part_tbl
            .read()
            .lookup(partno)
            .ok_or(BlockError::NoSuchDevice)?;

        let mut inner = self.inner();
        if inner.state != DiskState::Registered {
            return Err(BlockError::NoSuchDevice);
        }
        if for_write && (self.get_read_only() || part.read_only()) {
            return Err(BlockError::ReadOnlyViolation);
        }
        inner.open_count += 1;
        if for_write {
            inner.write_opens += 1;
        }
        drop(inner);

        return Ok(BlockDevHandle {
            diskseq: self.diskseq(),
            disk: self.clone(),
            part,
            for_write,
            closed: false,
        });
    }

    pub(crate) fn close_one(self: &Arc<Self>, for_write: bool) {
        let mut inner = self.inner();
        if inner.open_count == 0 {
            warn!("gendisk {}: close without matching open", self.name);
            return;
        }
        inner.open_count -= 1;
        if for_write {
            inner.write_opens -= 1;
        }
        let maybe_release = inner.open_count == 0 && inner.state == DiskState::Dead;
        drop(inner);

        if maybe_release {
            if let Some(manager) = self.manager.upgrade() {
                manager.try_release(self);
            }
        }
    }

    /// # 轮询一次事件
    ///
    /// 向驱动查询自上次以来发生的事件并处理：介质更换触发重验并（在UEVENT
    /// 策略下）转发通知；弹出请求只转发、不触发重验——在介质真正更换前，
    /// 弹出是建议性的而非破坏性的。
    ///
    /// 事件被block或磁盘不存活时幂等地返回空集。
    pub fn check_events(self: &Arc<Self>) -> DiskEventKind {
        self.poll_events(self.events.supported())
    }

    /// # 同步冲刷mask中的待处理事件
    ///
    /// 不等待轮询间隔，立即向驱动查询mask限定的事件并照常处理；
    /// mask之外的pending注入保持挂起，留给下一次完整检查。
    pub fn flush_events(self: &Arc<Self>, mask: DiskEventKind) -> DiskEventKind {
        self.poll_events(mask & self.events.supported())
    }

    fn poll_events(self: &Arc<Self>, clearing: DiskEventKind) -> DiskEventKind {
        if self.events.blocked() || !self.disk_live() {
            return DiskEventKind::empty();
        }
        let mut fired = self.ops.check_events(clearing) & clearing;
        let pending = self.events.take_pending();
        self.events.inject(pending & !clearing);
        fired |= pending & clearing;

        if fired.contains(DiskEventKind::MEDIA_CHANGE) {
            // 介质身份已变化：推进序列号，旧引用全部失效
            if let Some(manager) = self.manager.upgrade() {
                self.bind_diskseq(manager.next_diskseq());
            }
            self.set_state_bits(GdStateFlags::NEED_PART_SCAN);
            if let Err(e) = self.revalidate(true) {
                warn!("gendisk {}: revalidation after media change failed: {:?}", self.name, e);
            }
            if self.events.flags().contains(DiskEventFlags::UEVENT) {
                self.announce(DiskUevent::MediaChange);
            }
        }
        if fired.contains(DiskEventKind::EJECT_REQUEST)
            && self.events.flags().contains(DiskEventFlags::UEVENT)
        {
            self.announce(DiskUevent::Eject);
        }
        return fired;
    }

    /// 不经过驱动、直接注入一次介质更换事件并立即处理。
    /// 供带外检测到介质变化的驱动使用。
    pub fn force_media_change(self: &Arc<Self>) -> bool {
        self.events.inject(DiskEventKind::MEDIA_CHANGE);
        return self.check_events().contains(DiskEventKind::MEDIA_CHANGE);
    }

    pub(crate) fn announce(self: &Arc<Self>, event: DiskUevent) {
        if self.flags.contains(GenDiskFlags::HIDDEN) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.notify(self, event);
        }
    }
}

impl Debug for GenDisk {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GenDisk")
            .field("name", &self.name)
            .field("devnum", &self.devnum)
            .field("diskseq", &self.diskseq())
            .finish()
    }
}

impl Drop for GenDisk {
    fn drop(&mut self) {
        // 分配后从未注册的磁盘在此归还设备号区段，注册过的磁盘由try_release归还
        let state = self.inner().state;
        if state == DiskState::Allocated {
            if let Some(manager) = self.manager.upgrade() {
                manager.release_region(self.devnum, self.minors);
                info!("gendisk {}: unregistered-before-add, node region freed", self.name);
            }
        }
    }
}

/// @brief 打开磁盘/分区得到的句柄
///
/// 持有期间磁盘对象保持存活。随`Drop`自动关闭，也可以显式`close`。
/// 句柄记录打开时刻的序列号：跨越介质更换或注销/重注册周期后，
/// `is_stale`返回true。
pub struct BlockDevHandle {
    disk: Arc<GenDisk>,
    part: Arc<Partition>,
    for_write: bool,
    diskseq: u64,
    closed: bool,
}

impl BlockDevHandle {
    #[inline]
    pub fn disk(&self) -> &Arc<GenDisk> {
        &self.disk
    }

    #[inline]
    pub fn partition(&self) -> &Arc<Partition> {
        &self.part
    }

    #[inline]
    pub fn for_write(&self) -> bool {
        self.for_write
    }

    #[inline]
    pub fn diskseq(&self) -> u64 {
        self.diskseq
    }

    /// 句柄是否已经跨越了一次介质身份变化
    pub fn is_stale(&self) -> bool {
        self.diskseq != self.disk.diskseq()
    }

    pub fn close(mut self) {
        self.do_close();
    }

    fn do_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.disk.close_one(self.for_write);
    }
}

impl Drop for BlockDevHandle {
    fn drop(&mut self) {
        self.do_close();
    }
}

impl Debug for BlockDevHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockDevHandle")
            .field("disk", &self.disk.name())
            .field("partno", &self.part.partno())
            .field("for_write", &self.for_write)
            .field("diskseq", &self.diskseq)
            .finish()
    }
}
