use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use log::warn;

use crate::manager::BlockDevManager;

bitflags! {
    /// 驱动可以上报的事件类型
    pub struct DiskEventKind: u32 {
        /// 介质已更换
        const MEDIA_CHANGE = 1 << 0;
        /// 请求弹出介质
        const EJECT_REQUEST = 1 << 1;
    }
}

bitflags! {
    /// 事件处理策略标志
    pub struct DiskEventFlags: u32 {
        /// 即使poll间隔未配置也强制轮询，且不受独占写打开的抑制
        const POLL = 1 << 0;
        /// 事件转发到外部通知层
        const UEVENT = 1 << 1;
        /// 磁盘被独占写打开期间暂停轮询
        const BLOCK_ON_EXCL_WRITE = 1 << 2;
    }
}

/// POLL标志置位但未配置间隔时使用的默认轮询间隔
pub const DISK_EVENT_DFL_POLL_MSECS: u64 = 2000;

/// @brief 每个磁盘的事件状态
///
/// block/unblock按深度嵌套：N次block需要N次unblock才恢复轮询，
/// 供长时间的维护操作（如完整重验）确定性地抑制事件噪声。
/// 计数器全部无锁：只需要单调/幂等语义，不与磁盘互斥锁产生交互。
#[derive(Debug)]
pub struct DiskEvents {
    supported: DiskEventKind,
    flags: DiskEventFlags,
    block_depth: AtomicU32,
    poll_msecs: AtomicU64, // 0表示未配置
    last_poll_ms: AtomicU64,
    /// 由force_media_change注入、尚未被一次poll消费的事件
    pending: AtomicU32,
}

impl DiskEvents {
    pub(crate) fn new(supported: DiskEventKind, flags: DiskEventFlags) -> Self {
        DiskEvents {
            supported,
            flags,
            block_depth: AtomicU32::new(0),
            poll_msecs: AtomicU64::new(0),
            last_poll_ms: AtomicU64::new(0),
            pending: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn supported(&self) -> DiskEventKind {
        self.supported
    }

    #[inline]
    pub fn flags(&self) -> DiskEventFlags {
        self.flags
    }

    /// 暂停事件轮询，返回新的嵌套深度
    pub fn block(&self) -> u32 {
        self.block_depth.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 恢复一层事件轮询，返回剩余嵌套深度
    pub fn unblock(&self) -> u32 {
        let prev = self.block_depth.load(Ordering::SeqCst);
        if prev == 0 {
            warn!("disk events: unblock without matching block");
            return 0;
        }
        // 并发的unblock竞争同一计数时退避重试
        match self
            .block_depth
            .compare_exchange(prev, prev - 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => prev - 1,
            Err(_) => self.unblock(),
        }
    }

    #[inline]
    pub fn blocked(&self) -> bool {
        self.block_depth.load(Ordering::SeqCst) > 0
    }

    pub fn set_poll_msecs(&self, msecs: u64) {
        self.poll_msecs.store(msecs, Ordering::SeqCst);
    }

    pub fn poll_msecs(&self) -> u64 {
        self.poll_msecs.load(Ordering::SeqCst)
    }

    pub(crate) fn inject(&self, kinds: DiskEventKind) {
        self.pending.fetch_or(kinds.bits(), Ordering::SeqCst);
    }

    pub(crate) fn take_pending(&self) -> DiskEventKind {
        DiskEventKind::from_bits_truncate(self.pending.swap(0, Ordering::SeqCst))
    }

    /// 本轮tick是否应当轮询该磁盘。间隔未配置时仅在POLL标志下
    /// 按默认间隔轮询。
    pub(crate) fn poll_due(&self, now_ms: u64) -> bool {
        let mut interval = self.poll_msecs();
        if interval == 0 {
            if !self.flags.contains(DiskEventFlags::POLL) {
                return false;
            }
            interval = DISK_EVENT_DFL_POLL_MSECS;
        }
        return now_ms.saturating_sub(self.last_poll_ms.load(Ordering::SeqCst)) >= interval;
    }

    pub(crate) fn mark_polled(&self, now_ms: u64) {
        self.last_poll_ms.store(now_ms, Ordering::SeqCst);
    }
}

/// @brief 事件轮询调度器
///
/// 时钟由调用方注入（毫秒单调时间），本层不直接依赖计时设施；
/// 宿主环境以固定节拍调用`tick`即可。
pub struct EventPoller {
    manager: Arc<BlockDevManager>,
}

impl EventPoller {
    pub fn new(manager: Arc<BlockDevManager>) -> Self {
        EventPoller { manager }
    }

    /// # 执行一轮轮询
    ///
    /// 只轮询满足以下全部条件的磁盘：已注册且存活、事件未被block、
    /// 到达其轮询间隔、且（除非POLL标志置位）未因独占写打开而被抑制。
    ///
    /// ## 返回值
    ///
    /// 实际轮询的磁盘数量
    pub fn tick(&self, now_ms: u64) -> usize {
        let mut polled = 0;
        for disk in self.manager.disks() {
            let events = disk.events();
            if events.supported().is_empty() {
                continue;
            }
            if !disk.disk_live() || events.blocked() {
                continue;
            }
            let flags = events.flags();
            if flags.contains(DiskEventFlags::BLOCK_ON_EXCL_WRITE)
                && !flags.contains(DiskEventFlags::POLL)
                && disk.excl_write_open()
            {
                // 保护写密集负载不被探测引入延迟尖峰
                continue;
            }
            if !events.poll_due(now_ms) {
                continue;
            }
            events.mark_polled(now_ms);
            disk.check_events();
            polled += 1;
        }
        return polled;
    }
}

/// 事件block的RAII守卫，离开作用域时恢复一层轮询
pub(crate) struct EventBlockGuard<'a> {
    events: &'a DiskEvents,
}

impl<'a> EventBlockGuard<'a> {
    pub fn new(events: &'a DiskEvents) -> Self {
        events.block();
        Self { events }
    }
}

impl Drop for EventBlockGuard<'_> {
    fn drop(&mut self) {
        self.events.unblock();
    }
}
