use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::error::BlockError;
use crate::gendisk::{DiskState, GenDisk};

/// 一条holder关系：consumer（堆叠设备）建立在provider（下层设备）之上
struct HolderLink {
    consumer: Weak<GenDisk>,
    /// provider持强引用：只要链接存在，下层磁盘的后备状态就不会消失。
    /// consumer→provider方向构成DAG，不会成环。
    provider: Arc<GenDisk>,
}

impl HolderLink {
    /// 按对象身份匹配，不按设备名：设备名允许跨注销/重注册周期复用，
    /// 同名的两代磁盘是不同的链接端点。
    fn matches(&self, consumer: &Arc<GenDisk>, provider: &Arc<GenDisk>) -> bool {
        Arc::ptr_eq(&self.provider, provider)
            && core::ptr::eq(self.consumer.as_ptr(), Arc::as_ptr(consumer))
    }

    fn has_provider(&self, provider: &Arc<GenDisk>) -> bool {
        Arc::ptr_eq(&self.provider, provider)
    }

    fn has_consumer(&self, consumer: &Arc<GenDisk>) -> bool {
        core::ptr::eq(self.consumer.as_ptr(), Arc::as_ptr(consumer))
    }
}

/// @brief holder关系表
///
/// 双向索引整个关系集合，由一把关系级的锁保护。
/// 锁与任何单个磁盘的互斥锁无关：两个磁盘经由第三者间接互链时
/// 不会产生锁序倒置。
pub(crate) struct HolderLinks {
    inner: Mutex<Vec<HolderLink>>,
}

impl HolderLinks {
    pub fn new() -> Self {
        HolderLinks {
            inner: Mutex::new(Vec::new()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Vec<HolderLink>> {
        self.inner.lock()
    }

    /// # 记录consumer对provider的claim
    ///
    /// 同一对磁盘对象重复link是no-op成功而不是错误：堆叠驱动重新探测后
    /// 可能合法地重建链接。任一侧已Released时返回`NoSuchDevice`。
    pub fn link(&self, consumer: &Arc<GenDisk>, provider: &Arc<GenDisk>) -> Result<(), BlockError> {
        if consumer.state() == DiskState::Released || provider.state() == DiskState::Released {
            return Err(BlockError::NoSuchDevice);
        }
        let mut inner = self.inner();
        for link in inner.iter() {
            if link.matches(consumer, provider) {
                return Ok(());
            }
        }
        inner.push(HolderLink {
            consumer: Arc::downgrade(consumer),
            provider: provider.clone(),
        });
        Ok(())
    }

    /// 移除一条claim，返回是否确实存在过
    pub fn unlink(&self, consumer: &Arc<GenDisk>, provider: &Arc<GenDisk>) -> bool {
        let mut inner = self.inner();
        let before = inner.len();
        inner.retain(|link| !link.matches(consumer, provider));
        return inner.len() != before;
    }

    /// provider对象上还存在的holder数量
    pub fn holder_count(&self, provider: &Arc<GenDisk>) -> usize {
        self.inner()
            .iter()
            .filter(|link| link.has_provider(provider))
            .count()
    }

    /// 枚举建立在provider之上的所有consumer磁盘
    pub fn holders_of(&self, provider: &Arc<GenDisk>) -> Vec<Arc<GenDisk>> {
        self.inner()
            .iter()
            .filter(|link| link.has_provider(provider))
            .filter_map(|link| link.consumer.upgrade())
            .collect()
    }

    /// 枚举consumer所消费的所有provider磁盘
    pub fn providers_of(&self, consumer: &Arc<GenDisk>) -> Vec<Arc<GenDisk>> {
        self.inner()
            .iter()
            .filter(|link| link.has_consumer(consumer))
            .map(|link| link.provider.clone())
            .collect()
    }
}
