//! Process-title helper so `ps` output distinguishes the master from the
//! workers of each topic. Uses `prctl(PR_SET_NAME)` on Linux (15-byte limit);
//! other platforms keep their default title.

#[cfg(target_os = "linux")]
pub fn set_title(title: &str) {
    let bytes = title.as_bytes();
    let truncated = &bytes[..bytes.len().min(15)];
    if let Ok(c_title) = std::ffi::CString::new(truncated.to_vec()) {
        unsafe {
            libc::prctl(libc::PR_SET_NAME, c_title.as_ptr(), 0, 0, 0);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_title(_title: &str) {}
