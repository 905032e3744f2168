use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};

use crate::block_device::{GeneralBlockRange, LBA_SIZE};
use crate::error::BlockError;
use crate::events::EventBlockGuard;
use crate::gendisk::{GdStateFlags, GenDisk, GenDiskFlags};
use crate::mbr::MbrDiskPartitionTable;
use crate::partition::Partition;

impl GenDisk {
    /// # 重验磁盘：重新探测容量并重建分区表
    ///
    /// 扫描期间事件轮询被block，防止并发的事件驱动失效与扫描竞争。
    ///
    /// ## 参数
    ///
    /// - `invalidate`: 探测到容量为0（无介质）时，是否将磁盘失效：
    ///   清除本征容量位、容量清零、丢弃全部分区。为false时容量为0
    ///   只更新容量，保留分区表。
    ///
    /// ## 返回值
    ///
    /// - `Ok(changed)`: 本次重验后容量或分区布局是否与之前不同
    /// - `Err(MediaProbeFailed)`: 探测或分区表读取的I/O失败。
    ///   既有分区表保持原样——瞬时I/O错误绝不清空分区表，
    ///   避免已打开的分区被误伤。
    pub fn revalidate(self: &Arc<Self>, invalidate: bool) -> Result<bool, BlockError> {
        let _block_guard = EventBlockGuard::new(&self.events);

        let capacity = self.ops.probe_capacity().map_err(|e| {
            warn!("gendisk {}: capacity probe failed: {:?}", self.name(), e);
            BlockError::MediaProbeFailed
        })?;

        if capacity == 0 && invalidate {
            self.clear_state_bits(GdStateFlags::NATIVE_CAPACITY);
            let cap_changed = self.set_capacity_and_notify(0);
            let had_parts = self.part_tbl.write().drop_all();
            self.clear_state_bits(GdStateFlags::NEED_PART_SCAN);
            return Ok(cap_changed || had_parts);
        }

        // 容量0表示无介质：不声称探测到了本征容量
        if capacity > 0 {
            self.set_state_bits(GdStateFlags::NATIVE_CAPACITY);
        } else {
            self.clear_state_bits(GdStateFlags::NATIVE_CAPACITY);
        }
        let cap_changed = self.set_capacity_and_notify(capacity);

        let new_parts = if self.scan_allowed() {
            self.scan_partitions(capacity)?
        } else {
            Vec::new()
        };

        let layout_changed = {
            let mut tbl = self.part_tbl.write();
            let changed = !tbl.layout_matches(&new_parts);
            if changed {
                // 新表在锁外完整构建，此处整体发布
                tbl.replace_all(new_parts);
            }
            changed
        };
        self.clear_state_bits(GdStateFlags::NEED_PART_SCAN);

        if let Some(manager) = self.manager.upgrade() {
            manager.notifier().add_disk_randomness(self);
        }
        return Ok(cap_changed || layout_changed);
    }

    fn scan_allowed(&self) -> bool {
        !self.flags().contains(GenDiskFlags::NO_PART)
            && !self
                .state_bits()
                .contains(GdStateFlags::SUPPRESS_PART_SCAN)
    }

    /// 通过驱动的I/O路径读取0号扇区并解析分区布局。
    /// 越界表项截断、重叠表项丢弃，二者都只计入诊断，不导致失败。
    fn scan_partitions(self: &Arc<Self>, capacity: u64) -> Result<Vec<Arc<Partition>>, BlockError> {
        let mut buf = vec![0u8; LBA_SIZE];
        self.ops.read_at_sync(0, 1, &mut buf).map_err(|e| {
            warn!(
                "gendisk {}: partition sector read failed: {:?}",
                self.name(),
                e
            );
            BlockError::MediaProbeFailed
        })?;

        let table = match MbrDiskPartitionTable::from_sector(&buf) {
            Ok(table) => table,
            Err(BlockError::PartitionTableInconsistent) => {
                // 没有有效的分区表：整盘作为唯一的0号分区使用
                debug!("gendisk {}: no valid partition table", self.name());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut new_parts: Vec<Arc<Partition>> = Vec::new();
        let mut truncated = 0usize;
        for (slot, entry) in table.partitions_raw() {
            let partno = (slot + 1) as u32;
            let start = entry.starting_lba as u64;
            let mut sectors = entry.total_sectors as u64;

            if start >= capacity {
                truncated += 1;
                continue;
            }
            if start + sectors > capacity {
                truncated += 1;
                sectors = capacity - start;
            }

            let range = GeneralBlockRange::new(start as usize, (start + sectors) as usize);
            let overlaps = range.map_or(false, |range| {
                new_parts.iter().any(|p| {
                    p.range()
                        .map_or(false, |existing| existing.intersects_with(&range).is_some())
                })
            });
            if overlaps {
                truncated += 1;
                continue;
            }

            new_parts.push(Partition::new(
                partno,
                start,
                sectors,
                None,
                self.self_ref.clone(),
            ));
        }

        if truncated > 0 {
            // 降级而不是失败：能用的分区照常发布
            warn!(
                "gendisk {}: partition table inconsistent, {} entries truncated or dropped",
                self.name(),
                truncated
            );
        }
        return Ok(new_parts);
    }

    /// 将磁盘标记为无介质：容量清零、丢弃分区。
    /// 可移动介质拔出后驱动调用。
    pub fn invalidate_disk(self: &Arc<Self>) {
        self.clear_state_bits(GdStateFlags::NATIVE_CAPACITY);
        self.set_capacity_and_notify(0);
        self.part_tbl.write().drop_all();
    }
}
