#[cfg(unix)]
pub(crate) use std::os::unix::fs::OpenOptionsExt;

#[cfg(windows)]
pub(crate) trait OpenOptionsExt {
    fn custom_flags(&mut self, flags: i32) -> &mut Self;
    fn mode(&mut self, mode: u32) -> &mut Self;
}

#[cfg(windows)]
impl OpenOptionsExt for std::fs::OpenOptions {
    fn custom_flags(&mut self, _flags: i32) -> &mut Self {
        // FILE_FLAG_NO_BUFFERING / FILE_FLAG_WRITE_THROUGH need `CreateFileW`,
        // which `std::fs::OpenOptions` does not expose.
        self
    }

    fn mode(&mut self, _mode: u32) -> &mut Self {
        self
    }
}

/// `O_DIRECT` where the platform has it.
pub(crate) fn direct_flag() -> i32 {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        libc::O_DIRECT
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        0
    }
}

/// `O_SYNC` where the platform has it.
pub(crate) fn sync_flag() -> i32 {
    #[cfg(unix)]
    {
        libc::O_SYNC
    }
    #[cfg(not(unix))]
    {
        0
    }
}
