//! The kernel message-queue primitive behind an agent.
//!
//! `QueueHandle` is the seam between the bus and the operating system: the
//! `Posix` variant wraps one `mq_*` descriptor, the `Solipsist` variant is
//! no queue at all and makes the bus deliver straight into the recipient's
//! received list.

use std::ffi::CString;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info};
use nix::errno::Errno;
use nix::mqueue::{self, MqAttr, MqdT, MQ_OFlag};
use nix::sys::stat::Mode;
use nix::sys::time::TimeSpec;

use crate::agent::QueueAttrs;
use crate::error::{Error, Result};
use crate::message::Message;

/// Every message is queued at the same priority, so deliveries to one
/// recipient observe FIFO order.
pub(crate) const SEND_PRIORITY: u32 = 1;

/// Poll window of the non-blocking receive variant.
pub(crate) const RECEIVE_TIMEOUT: Duration = Duration::from_nanos(50);

/// Delivery mechanism attached to an agent.
pub(crate) enum QueueHandle {
    Posix(PosixQueue),
    Solipsist,
}

/// One open POSIX message queue.
pub(crate) struct PosixQueue {
    mqd: MqdT,
    name: CString,
}

impl PosixQueue {
    /// Opens the queue read-write with create-or-use semantics: exclusive
    /// creation first, then a plain open when the name already exists.
    pub(crate) fn open(path: &str, attrs: &QueueAttrs) -> Result<PosixQueue> {
        let name = CString::new(path).map_err(|_| Error::Transport(Errno::EINVAL))?;
        let attr = MqAttr::new(0, attrs.max_count as _, attrs.max_size as _, 0);
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let mut oflag = MQ_OFlag::O_RDWR;
        if attrs.flags & i64::from(libc::O_NONBLOCK) != 0 {
            oflag |= MQ_OFlag::O_NONBLOCK;
        }

        let create = oflag | MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL;
        let mqd = match mqueue::mq_open(name.as_c_str(), create, mode, Some(&attr)) {
            Ok(mqd) => {
                info!("created message queue {}", path);
                mqd
            }
            Err(Errno::EEXIST) => match mqueue::mq_open(name.as_c_str(), oflag, mode, Some(&attr)) {
                Ok(mqd) => {
                    info!("using existing message queue {}", path);
                    mqd
                }
                Err(err) => {
                    error!("cannot open existing message queue {}: {}", path, err);
                    return Err(err.into());
                }
            },
            Err(err) => {
                error!("cannot create message queue {}: {}", path, err);
                return Err(err.into());
            }
        };
        Ok(PosixQueue { mqd, name })
    }

    pub(crate) fn send(&self, frame: &[u8]) -> nix::Result<()> {
        mqueue::mq_send(&self.mqd, frame, SEND_PRIORITY)
    }

    /// Receives one frame into `message`. `timeout` of `None` blocks until
    /// a message arrives; otherwise the wait ends at now + `timeout`.
    pub(crate) fn receive(
        &self,
        message: &mut Message,
        timeout: Option<Duration>,
    ) -> nix::Result<usize> {
        let mut priority = 0u32;
        let frame = crate::struct_bytes_mut(message);
        match timeout {
            Some(window) => {
                let deadline = TimeSpec::from_duration(wall_clock() + window);
                mqueue::mq_timedreceive(&self.mqd, frame, &mut priority, &deadline)
            }
            None => mqueue::mq_receive(&self.mqd, frame, &mut priority),
        }
    }

    pub(crate) fn attributes(&self) -> nix::Result<MqAttr> {
        mqueue::mq_getattr(&self.mqd)
    }

    /// Pushes the cached flags to the kernel. Only the non-blocking bit is
    /// honored after creation.
    pub(crate) fn set_flags(&self, attrs: &QueueAttrs) -> nix::Result<()> {
        let attr = MqAttr::new(attrs.flags as _, attrs.max_count as _, attrs.max_size as _, 0);
        mqueue::mq_setattr(&self.mqd, &attr).map(|_| ())
    }

    /// Closes the descriptor, then unlinks the queue name regardless of how
    /// the close went.
    pub(crate) fn destroy(self) -> nix::Result<()> {
        let PosixQueue { mqd, name } = self;
        if let Err(err) = mqueue::mq_close(mqd) {
            error!("mq_close failed: {}", err);
        }
        mqueue::mq_unlink(name.as_c_str())
    }
}

/// Current wall-clock time, for the absolute deadlines `mq_timedreceive`
/// expects.
fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}
