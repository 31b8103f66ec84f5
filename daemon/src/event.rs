use tokio::sync::oneshot;

use crate::pipe::{ControlCommand, StatusReply};

/// Inputs to the watcher's event loop. Termination signals do not come through
/// here; they flip the shared stop flag directly.
pub enum WatcherEvent {
    /// A command arrived on the control pipe; the reply goes back on the status pipe.
    Control {
        command: ControlCommand,
        reply: oneshot::Sender<StatusReply>,
    },
    /// The config file changed on disk; apply it as if `reload` was sent.
    ConfigChanged,
}
