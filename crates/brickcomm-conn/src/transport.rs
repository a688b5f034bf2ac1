use crate::buffer::ConnectionBuffer;

/// Hooks a transport provides to the connections it owns.
///
/// `output_queued` and `input_wanted` are called with the buffer lock held
/// and must only signal the transport's worker; they must not call back
/// into the buffer. `disconnect` is called without the lock.
pub trait Transport: Send + Sync {
    /// New output is waiting in the buffer.
    fn output_queued(&self);

    /// The input buffer is empty and a reader wants more.
    fn input_wanted(&self);

    /// Tear down the underlying link after a local close.
    ///
    /// Returns false if the link could not be asked to close; the buffer
    /// then marks itself disconnected without waiting for confirmation.
    /// On success the transport reports completion through
    /// [`ConnectionBuffer::disconnected`].
    fn disconnect(&self, buffer: &ConnectionBuffer) -> bool;

    /// Whether a zero-length packet is sent on close in packet mode.
    fn sends_eof(&self) -> bool {
        true
    }
}
