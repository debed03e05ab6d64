use core::fmt;

/// Outcome of an operation on a ring, the block list or the log buffer built from them.
///
/// One taxonomy for all layers.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success = 0,
    /// Nothing committed is left to read.
    Empty,
    /// The block has too few free bytes; move on to another block or apply the overflow policy.
    NotEnoughSpace,
    /// Another producer holds the reservation of the block. Retry, or move on.
    AllocFailedByRaceCondition,
    /// Zero bytes or more than a block can ever hold were requested.
    AllocSizeInvalid,
    /// The buffer was used before it was opened or after it was closed.
    BufferNotInited,
    /// An entry would have straddled the physical end of a ring and only the padding up to the end
    /// fit. The next allocation on the ring starts at its front.
    DataNotContiguous,
    /// A bounded wait ran out, or the consumer side is busy. Try again later.
    WaitAndRetry,
    /// Flushing the backing file failed; the entry is committed but not durable.
    MmapSync,
}

impl ResultCode {
    pub const COUNT: usize = 9;

    pub const ALL: [ResultCode; Self::COUNT] = [
        ResultCode::Success,
        ResultCode::Empty,
        ResultCode::NotEnoughSpace,
        ResultCode::AllocFailedByRaceCondition,
        ResultCode::AllocSizeInvalid,
        ResultCode::BufferNotInited,
        ResultCode::DataNotContiguous,
        ResultCode::WaitAndRetry,
        ResultCode::MmapSync,
    ];

    /// Conditions that go away by themselves: retrying may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ResultCode::NotEnoughSpace
                | ResultCode::AllocFailedByRaceCondition
                | ResultCode::DataNotContiguous
                | ResultCode::WaitAndRetry
        )
    }

    /// Misuse by the caller. Retrying never succeeds.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ResultCode::AllocSizeInvalid | ResultCode::BufferNotInited
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::Empty => "empty",
            ResultCode::NotEnoughSpace => "not_enough_space",
            ResultCode::AllocFailedByRaceCondition => "alloc_failed_by_race_condition",
            ResultCode::AllocSizeInvalid => "alloc_size_invalid",
            ResultCode::BufferNotInited => "buffer_not_inited",
            ResultCode::DataNotContiguous => "data_not_contiguous",
            ResultCode::WaitAndRetry => "wait_and_retry",
            ResultCode::MmapSync => "mmap_sync",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The handle exchanged with adjacent layers that do not speak Rust lifetimes.
///
/// `data_addr` is null unless `result` is `Success`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawHandle {
    pub data_addr: *mut u8,
    pub result: ResultCode,
}

impl RawHandle {
    pub fn failed(result: ResultCode) -> Self {
        RawHandle {
            data_addr: core::ptr::null_mut(),
            result,
        }
    }

    /// The handle of a granted chunk, or the code of a refused one.
    pub fn from_result<'r, T>(result: &'r Result<T, ResultCode>) -> Self
    where
        &'r T: Into<RawHandle>,
    {
        match result {
            Ok(handle) => handle.into(),
            Err(code) => RawHandle::failed(*code),
        }
    }
}

#[test]
fn codes_are_classified_once() {
    for code in ResultCode::ALL {
        assert!(!(code.is_transient() && code.is_fatal()), "{code}");
        assert_eq!(ResultCode::ALL[code as usize], code);
    }
}
