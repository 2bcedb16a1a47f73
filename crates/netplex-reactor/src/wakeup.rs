//! Cross-thread wakeup channel
//!
//! Producers on any thread push closures into a mutex-guarded FIFO and
//! kick an eventfd; the reactor drains both from its own thread through
//! a permanent [`WakeupHandle`] registered like any other handle. The
//! eventfd counter only signals "something is queued", so a saturated
//! counter write is not an error. Commands run on the reactor thread
//! with an [`EventScope`], never with the reactor itself.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

use netplex_core::handle::{Disposition, EventScope, ReadinessHandle, RemoveDisposition, RemoveReason};
use netplex_core::{kdebug, ktrace, kwarn};
use netplex_core::error::{ReactorError, ReactorResult};

use crate::poller::os_err;

/// A named closure queued for execution on a reactor thread
pub struct Command {
    name: &'static str,
    action: Box<dyn FnOnce(&mut EventScope) + Send>,
}

impl Command {
    pub fn new(name: &'static str, action: impl FnOnce(&mut EventScope) + Send + 'static) -> Command {
        Command {
            name,
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn run(self, scope: &mut EventScope) {
        (self.action)(scope)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command").field("name", &self.name).finish()
    }
}

struct CommandQueue {
    commands: VecDeque<Command>,
    shutdown: bool,
}

struct WakeupShared {
    queue: Mutex<CommandQueue>,
    efd: EventFd,
}

impl WakeupShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, CommandQueue> {
        // A poisoned queue is still structurally sound: every mutation
        // is a single push/pop/flag store.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a connected wakeup pair.
///
/// Returns:
/// * `WakeupSender` - cloneable producer side, usable from any thread
/// * `WakeupHandle` - the consumer side, to be registered with exactly
///   one reactor
pub fn wakeup_channel() -> ReactorResult<(WakeupSender, WakeupHandle)> {
    let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
        .map_err(os_err)?;
    let shared = Arc::new(WakeupShared {
        queue: Mutex::new(CommandQueue {
            commands: VecDeque::new(),
            shutdown: false,
        }),
        efd,
    });
    let sender = WakeupSender {
        shared: Arc::clone(&shared),
    };
    let handle = WakeupHandle { shared };
    Ok((sender, handle))
}

/// Producer side of the wakeup channel
#[derive(Clone)]
pub struct WakeupSender {
    shared: Arc<WakeupShared>,
}

impl WakeupSender {
    /// Queue a command and kick the reactor out of its wait.
    ///
    /// Fails with [`ReactorError::Shutdown`] once the consuming reactor
    /// has torn its wakeup handle down.
    pub fn push(&self, command: Command) -> ReactorResult<()> {
        {
            let mut queue = self.shared.lock();
            if queue.shutdown {
                return Err(ReactorError::Shutdown);
            }
            queue.commands.push_back(command);
        }
        self.kick()
    }

    fn kick(&self) -> ReactorResult<()> {
        match self.shared.efd.arm() {
            Ok(_) => Ok(()),
            // Counter saturated: a wakeup is already pending.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(os_err(e)),
        }
    }
}

/// Consumer side: a permanent readiness handle over the eventfd
pub struct WakeupHandle {
    shared: Arc<WakeupShared>,
}

impl ReadinessHandle for WakeupHandle {
    fn name(&self) -> &str {
        "wakeup"
    }

    fn raw_fd(&self) -> RawFd {
        self.shared.efd.as_fd().as_raw_fd()
    }

    fn want_read(&self) -> bool {
        true
    }

    fn is_permanent(&self) -> bool {
        true
    }

    fn on_readable(&mut self, scope: &mut EventScope) -> Disposition {
        let kicks = match self.shared.efd.read() {
            Ok(n) => n,
            // Another drain already consumed the counter.
            Err(Errno::EAGAIN) => return Disposition::Keep,
            Err(e) => {
                kwarn!("wakeup: eventfd read failed: {}", e);
                return Disposition::Keep;
            }
        };
        ktrace!("wakeup: draining after {} kicks", kicks);
        // One command per counted kick; anything queued past that has a
        // kick of its own still pending.
        for done in 0..kicks {
            // Pop under the lock, run outside it.
            let command = self.shared.lock().commands.pop_front();
            let Some(command) = command else {
                kwarn!(
                    "wakeup: counter and queue out of sync ({} kicks, {} commands)",
                    kicks,
                    done
                );
                break;
            };
            ktrace!("wakeup: running '{}'", command.name());
            command.run(scope);
        }
        Disposition::Keep
    }

    fn on_remove(&mut self, reason: RemoveReason, _scope: &mut EventScope) -> RemoveDisposition {
        let dropped = {
            let mut queue = self.shared.lock();
            queue.shutdown = true;
            let dropped = queue.commands.len();
            queue.commands.clear();
            dropped
        };
        if dropped > 0 {
            kdebug!("wakeup: dropped {} pending commands ({})", dropped, reason);
        }
        RemoveDisposition::Destroy
    }
}
