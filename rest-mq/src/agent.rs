//! Per-agent cached state and kernel limit discovery.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use log::error;

use crate::message::Message;
use crate::transport::QueueHandle;

/// Fail-safe ceilings used when the mqueue procfs entries are unreadable.
pub const FAIL_SAFE_MAX_COUNT: i64 = 5;
pub const FAIL_SAFE_MAX_SIZE: i64 = 4096;

const MSG_MAX: &str = "/proc/sys/fs/mqueue/msg_max";
const MSGSIZE_MAX: &str = "/proc/sys/fs/mqueue/msgsize_max";

/// Queue attributes cached for one agent. `flags` mirrors the open flags of
/// the underlying queue; only the non-blocking bit ever changes after
/// creation.
#[derive(Clone, Copy, Debug)]
pub struct QueueAttrs {
    pub max_count: i64,
    pub max_size: i64,
    pub flags: i64,
}

/// One queue endpoint and everything cached about it.
pub(crate) struct Agent {
    pub(crate) path: String,
    pub(crate) attrs: QueueAttrs,
    pub(crate) handle: QueueHandle,
    pub(crate) special_flags: i32,
    pub(crate) received: VecDeque<Message>,
}

impl Agent {
    pub(crate) fn new(path: &str, attrs: QueueAttrs, handle: QueueHandle) -> Agent {
        Agent {
            path: path.to_string(),
            attrs,
            handle,
            special_flags: 0,
            received: VecDeque::new(),
        }
    }
}

/// Kernel-imposed ceilings for queue creation: (max message count, max
/// message size).
pub fn system_limits() -> (i64, i64) {
    (
        read_limit(Path::new(MSG_MAX), FAIL_SAFE_MAX_COUNT),
        read_limit(Path::new(MSGSIZE_MAX), FAIL_SAFE_MAX_SIZE),
    )
}

fn read_limit(path: &Path, fallback: i64) -> i64 {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            error!("failure to read {}: {}", path.display(), err);
            return fallback;
        }
    };
    match text.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            error!("failure to parse {}", path.display());
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn limits_parse_from_procfs_format() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"8192\n").unwrap();
        assert_eq!(read_limit(file.path(), FAIL_SAFE_MAX_SIZE), 8192);
    }

    #[test]
    fn unreadable_limit_falls_back() {
        assert_eq!(
            read_limit(Path::new("/nonexistent/msg_max"), FAIL_SAFE_MAX_COUNT),
            FAIL_SAFE_MAX_COUNT
        );
    }

    #[test]
    fn garbage_limit_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"plenty\n").unwrap();
        assert_eq!(read_limit(file.path(), FAIL_SAFE_MAX_COUNT), FAIL_SAFE_MAX_COUNT);
    }
}
