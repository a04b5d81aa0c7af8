use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

pub const SNAPSHOT_EXPORT__BEFORE_SHARD_WRITE: &str = "snapshot_export.before_shard_write";
pub const INCREMENTAL__BEFORE_MERGE: &str = "incremental.before_merge";
pub const INCREMENTAL__AFTER_MERGE: &str = "incremental.after_merge";

pub fn sync_fail_point(name: &str) -> SyncResult<()> {
    fail_point!(name, |parameter| {
        let mut error_kind = ErrorKind::WithNoRetry;
        if let Some(parameter) = parameter {
            error_kind = match parameter.as_str() {
                "no_retry" => ErrorKind::WithNoRetry,
                "timed_retry" => ErrorKind::WithTimedRetry,
                _ => ErrorKind::WithNoRetry,
            }
        }

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
