use core::fmt;

/// 块设备层的错误码
///
/// Notice 对外暴露时使用 `to_posix_errno()` 转换为 Posix 规定的 int32_t 错误码，
/// 而不是直接传递enum。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// 动态主设备号命名空间已耗尽
    AllocationExhausted,
    /// 设备号区段与已注册区段重叠，或区段仍被引用
    NodeBusy,
    /// 磁盘已注册（重复register，或设备名冲突）
    AlreadyRegistered,
    /// 磁盘不存在、已标记死亡或分区号不存在
    NoSuchDevice,
    /// 对只读磁盘/分区发起写打开
    ReadOnlyViolation,
    /// 介质探测或分区表读取的I/O失败
    MediaProbeFailed,
    /// 分区表自身不一致（签名损坏、扇区范围越界等），降级处理
    PartitionTableInconsistent,
    /// 参数不合法
    InvalidArgument,
}

impl BlockError {
    pub fn to_posix_errno(&self) -> i32 {
        match self {
            BlockError::AllocationExhausted => -28,        // ENOSPC
            BlockError::NodeBusy => -16,                   // EBUSY
            BlockError::AlreadyRegistered => -17,          // EEXIST
            BlockError::NoSuchDevice => -19,               // ENODEV
            BlockError::ReadOnlyViolation => -30,          // EROFS
            BlockError::MediaProbeFailed => -5,            // EIO
            BlockError::PartitionTableInconsistent => -117, // EUCLEAN
            BlockError::InvalidArgument => -22,            // EINVAL
        }
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
