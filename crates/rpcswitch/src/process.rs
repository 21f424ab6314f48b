//! Code to adjust process-related parameters.

/// Set our current maximum-file limit to a large value, if we can.
///
/// A busy switch holds two sockets per forwarded call-pair, so the stock
/// soft limit runs out quickly.
///
/// This doesn't actually do anything on windows.
pub(crate) fn use_max_file_limit() {
    /// Default maximum value to set for our maximum-file limit.
    ///
    /// If the system supports more than this, we won't ask for it.
    const DFLT_MAX_N_FILES: u64 = 16384;

    match rlimit::increase_nofile_limit(DFLT_MAX_N_FILES) {
        Ok(n) => tracing::debug!("Increased process file limit to {}", n),
        Err(e) => tracing::warn!("Error while increasing file limit: {}", e),
    }
}
