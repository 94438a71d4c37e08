use crate::transport::RemoteStream;

/// UI-side collaborator notified of call milestones.
///
/// Callbacks run inside the signaling loop and must not block.
pub trait CallObserver: Send + Sync {
    fn on_assignment_ready(&self, _remote: &str) {}

    fn on_remote_stream(&self, _stream: RemoteStream, _remote: &str) {}

    fn on_fatal_error(&self, _reason: &str) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl CallObserver for NullObserver {}
