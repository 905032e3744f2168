use alloc::vec::Vec;

use log::error;

use crate::block_device::DevName;
use crate::device_number::{DeviceNumber, Major};
use crate::error::BlockError;

pub(crate) const DEV_MAJOR_HASH_SIZE: u32 = 255;
pub(crate) const DEV_MAJOR_MAX: Major = Major::new(512);

/* Marks the bottom of the first segment of free block majors */
pub(crate) const DEV_MAJOR_DYN_END: Major = Major::new(234);
/* Marks the top and bottom of the second segment of free block majors */
pub(crate) const DEV_MAJOR_DYN_EXT_START: Major = Major::new(511);
pub(crate) const DEV_MAJOR_DYN_EXT_END: Major = Major::new(384);

/// 块设备号区段在系统中的实例
#[derive(Debug, Clone)]
pub struct DeviceStruct {
    dev_t: DeviceNumber, // 起始设备号
    minorct: u32,        // 次设备号数量
    name: DevName,       // 块设备名
}

impl DeviceStruct {
    pub fn new(dev_t: DeviceNumber, minorct: u32, name: DevName) -> Self {
        Self {
            dev_t,
            minorct,
            name,
        }
    }

    pub fn device_number(&self) -> DeviceNumber {
        self.dev_t
    }

    pub fn base_minor(&self) -> u32 {
        self.dev_t.minor()
    }

    pub fn minorct(&self) -> u32 {
        self.minorct
    }

    pub fn name(&self) -> &DevName {
        &self.name
    }
}

/// @brief 块设备号分配器
///
/// 管理(major, minor)命名空间。不是全局单例：由BlockDevManager持有并在其锁内访问，
/// 以便在测试中注入独立的命名空间。
#[derive(Debug)]
pub struct BlkDevMap(Vec<Vec<DeviceStruct>>);

impl BlkDevMap {
    pub fn new() -> Self {
        BlkDevMap(vec![Vec::new(); DEV_MAJOR_HASH_SIZE as usize])
    }

    /// @brief: 主设备号转下标
    fn major_to_index(major: Major) -> usize {
        return (major.data() % DEV_MAJOR_HASH_SIZE) as usize;
    }

    /// @brief: 动态获取主设备号
    ///
    /// 先在234～254中从高向低寻找，再在384～511中从高向低寻找。
    fn find_dynamic_major(&self) -> Result<Major, BlockError> {
        // 寻找主设备号为234～254的设备
        for index in ((DEV_MAJOR_DYN_END.data())..DEV_MAJOR_HASH_SIZE).rev() {
            if let Some(item) = self.0.get(index as usize) {
                if item.is_empty() {
                    return Ok(Major::new(index));
                }
            }
        }
        // 寻找主设备号在384～511的设备
        for index in
            ((DEV_MAJOR_DYN_EXT_END.data() + 1)..(DEV_MAJOR_DYN_EXT_START.data() + 1)).rev()
        {
            if let Some(items) = self.0.get(Self::major_to_index(Major::new(index))) {
                let mut flag = true;
                for item in items {
                    if item.device_number().major() == Major::new(index) {
                        flag = false;
                        break;
                    }
                }
                if flag {
                    // 数组中不存在主设备号等于index的设备
                    return Ok(Major::new(index));
                }
            }
        }
        return Err(BlockError::AllocationExhausted);
    }

    /// @brief: 注册设备号区段
    ///
    /// ## 参数
    ///
    /// - `device_number`: 起始设备号，主设备号为0时动态分配
    /// - `minorct`: 次设备号数量
    /// - `name`: 块设备名
    ///
    /// ## 返回值
    ///
    /// 成功时返回实际分配到的起始设备号。次设备号区段与已注册区段重合时
    /// 返回`NodeBusy`，动态命名空间耗尽时返回`AllocationExhausted`。
    pub fn register_region(
        &mut self,
        device_number: DeviceNumber,
        minorct: u32,
        name: &DevName,
    ) -> Result<DeviceNumber, BlockError> {
        let mut major = device_number.major();
        let baseminor = device_number.minor();
        if major >= DEV_MAJOR_MAX {
            error!(
                "DEV {} major requested {:?} is greater than the maximum {}",
                name,
                major,
                DEV_MAJOR_MAX.data() - 1
            );
            return Err(BlockError::InvalidArgument);
        }
        if minorct == 0 || minorct > DeviceNumber::MINOR_MASK + 1 - baseminor {
            error!(
                "DEV {} minor range requested ({}-{}) is out of range of maximum range ({}-{}) for a single major",
                name,
                baseminor,
                baseminor.wrapping_add(minorct).wrapping_sub(1),
                0,
                DeviceNumber::MINOR_MASK
            );
            return Err(BlockError::InvalidArgument);
        }

        if major == Major::UNNAMED_MAJOR {
            // 如果主设备号为0,则自动分配主设备号
            major = self.find_dynamic_major()?;
        }

        let blockdev = DeviceStruct::new(DeviceNumber::new(major, baseminor), minorct, name.clone());
        if let Some(items) = self.0.get_mut(Self::major_to_index(major)) {
            let mut insert_index: usize = items.len();
            for (index, item) in items.iter().enumerate() {
                match item.device_number().major().cmp(&major) {
                    core::cmp::Ordering::Less => continue,
                    core::cmp::Ordering::Greater => {
                        insert_index = index; // 大于则向前插入
                        break;
                    }
                    core::cmp::Ordering::Equal => {
                        if item.base_minor() + item.minorct() <= baseminor {
                            continue; // 次设备号在被插入区段之前
                        }
                        if item.base_minor() >= baseminor + minorct {
                            insert_index = index; // 在此处插入
                            break;
                        }
                        return Err(BlockError::NodeBusy); // 存在重合的次设备号
                    }
                }
            }
            items.insert(insert_index, blockdev);
        }

        return Ok(DeviceNumber::new(major, baseminor));
    }

    /// @brief: 注销设备号区段
    ///
    /// 设备号与数量必须和注册时一致，否则返回`NodeBusy`。
    pub fn unregister_region(
        &mut self,
        device_number: DeviceNumber,
        minorct: u32,
    ) -> Result<(), BlockError> {
        if let Some(items) = self.0.get_mut(Self::major_to_index(device_number.major())) {
            for (index, item) in items.iter().enumerate() {
                if item.device_number() == device_number && item.minorct() == minorct {
                    items.remove(index);
                    return Ok(());
                }
            }
        }
        return Err(BlockError::NodeBusy);
    }

    /// 查询设备号所在的已注册区段
    pub fn lookup_region(&self, devnum: DeviceNumber) -> Option<&DeviceStruct> {
        let items = self.0.get(Self::major_to_index(devnum.major()))?;
        for item in items {
            if item.device_number().major() == devnum.major()
                && item.base_minor() <= devnum.minor()
                && devnum.minor() < item.base_minor() + item.minorct()
            {
                return Some(item);
            }
        }
        return None;
    }
}

impl Default for BlkDevMap {
    fn default() -> Self {
        Self::new()
    }
}
