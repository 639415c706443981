//! Length-prefixed message framing over anonymous pipes.
//!
//! Frames are a 4-byte big-endian payload length followed by the payload.
//! The framing is self-synchronizing over a byte stream as long as both ends
//! start at a frame boundary, which the control protocol guarantees.
//!
//! A [`FramedPipe`] holds up to two pipe halves: a read end and a write end,
//! each owned exclusively by one process after spawn. Close is idempotent
//! and guarded by an atomic flag so either side of the supervisor can tear
//! the channel down without coordinating.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;

use crate::error::PipeError;

/// Length of the frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Initial capacity of the receive buffer. Control messages are a few bytes,
/// so this also amortizes syscalls when frames arrive back to back.
const READ_BUFFER_CAPACITY: usize = 64 * 1024;

/// A framed message channel over one or two anonymous pipes.
pub struct FramedPipe {
    closed: AtomicBool,
    reader: Mutex<Option<pipe::Receiver>>,
    writer: Mutex<Option<pipe::Sender>>,
}

impl FramedPipe {
    fn new(reader: Option<pipe::Receiver>, writer: Option<pipe::Sender>) -> Self {
        Self {
            closed: AtomicBool::new(false),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Build a channel from already-open pipe ends.
    ///
    /// The descriptors are switched to non-blocking mode and registered with
    /// the tokio reactor.
    pub fn from_owned_fds(
        reader: Option<OwnedFd>,
        writer: Option<OwnedFd>,
    ) -> io::Result<Self> {
        let reader = match reader {
            Some(fd) => {
                set_nonblocking(fd.as_raw_fd())?;
                Some(pipe::Receiver::from_owned_fd(fd)?)
            }
            None => None,
        };
        let writer = match writer {
            Some(fd) => {
                set_nonblocking(fd.as_raw_fd())?;
                Some(pipe::Sender::from_owned_fd(fd)?)
            }
            None => None,
        };
        Ok(Self::new(reader, writer))
    }

    /// Reconstruct a bidirectional channel from inherited raw descriptors.
    ///
    /// Used by the worker child, which finds its control pipes at fixed fd
    /// numbers set up by the parent before exec.
    ///
    /// # Safety contract
    ///
    /// The fds must be open pipe ends owned by nothing else in the process;
    /// the returned channel takes ownership and will close them.
    pub fn from_raw_fds(read_fd: RawFd, write_fd: RawFd) -> io::Result<Self> {
        // SAFETY: per the constructor contract the fds are open, unowned pipe
        // ends inherited across exec for exactly this purpose.
        let (read, write) = unsafe {
            (
                OwnedFd::from_raw_fd(read_fd),
                OwnedFd::from_raw_fd(write_fd),
            )
        };
        Self::from_owned_fds(Some(read), Some(write))
    }

    /// Whether [`FramedPipe::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one frame: the length header followed by the payload.
    ///
    /// Both writes retry until every byte is delivered or the pipe reports a
    /// non-retryable error.
    pub async fn write(&self, payload: &[u8]) -> Result<(), PipeError> {
        if self.is_closed() {
            return Err(PipeError::Closed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(PipeError::Closed)?;

        let header = (payload.len() as u32).to_be_bytes();
        writer.write_all(&header).await?;
        writer.write_all(payload).await?;
        Ok(())
    }

    /// Stream incoming frames to `visit` until it returns `false`, the peer
    /// closes its end, or the pipe fails.
    ///
    /// The payload slice handed to the visitor is only valid for the duration
    /// of the call. End-of-file terminates the loop cleanly; when the visitor
    /// stops the stream, any bytes already buffered past that frame are
    /// discarded with this call's buffer.
    pub async fn read<F>(&self, mut visit: F) -> Result<(), PipeError>
    where
        F: FnMut(&[u8]) -> bool,
    {
        if self.is_closed() {
            return Err(PipeError::Closed);
        }
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(PipeError::Closed)?;

        let mut buf = crate::buffer::ByteBuffer::with_capacity(READ_BUFFER_CAPACITY);
        loop {
            buf.ensure_writable(1);
            let n = reader.read(buf.unfilled_mut()).await?;
            if n == 0 {
                // Peer closed its end.
                return Ok(());
            }
            buf.advance_write(n);

            while buf.readable() >= FRAME_HEADER_LEN {
                let frame_len = buf.peek_u32() as usize;
                if buf.readable() < FRAME_HEADER_LEN + frame_len {
                    // Incomplete frame. Make sure the rest can ever arrive.
                    buf.ensure_writable(FRAME_HEADER_LEN + frame_len - buf.readable());
                    break;
                }
                buf.advance_read(FRAME_HEADER_LEN);
                if !visit(buf.peek(frame_len)) {
                    return Ok(());
                }
                buf.advance_read(frame_len);
                buf.compact();
            }
        }
    }

    /// Close both halves. Safe to call from multiple tasks; only the first
    /// call drops the descriptors.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.reader.lock().await.take();
        self.writer.lock().await.take();
    }
}

/// Create an anonymous pipe with close-on-exec set on both ends.
///
/// Ends destined for a child are relocated with `dup2` before exec, which
/// clears the flag on the child's copy.
pub(crate) fn anon_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds is valid storage for the two descriptors pipe() fills in.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and belong to us alone.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an open fd with valid commands.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an open fd with valid commands.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn framed_pair() -> (FramedPipe, FramedPipe) {
        let (read, write) = anon_pipe().expect("anon pipe");
        let rx = FramedPipe::from_owned_fds(Some(read), None).expect("receiver");
        let tx = FramedPipe::from_owned_fds(None, Some(write)).expect("sender");
        (tx, rx)
    }

    #[tokio::test]
    async fn single_frame_round_trips() {
        let (tx, rx) = framed_pair();
        tx.write(b"ReadyOK").await.unwrap();
        tx.close().await;

        let mut frames = Vec::new();
        rx.read(|payload| {
            frames.push(payload.to_vec());
            true
        })
        .await
        .unwrap();

        assert_eq!(frames, vec![b"ReadyOK".to_vec()]);
    }

    #[tokio::test]
    async fn back_to_back_frames_arrive_in_order() {
        let (tx, rx) = framed_pair();
        for payload in [&b"one"[..], b"two", b"three", b""] {
            tx.write(payload).await.unwrap();
        }
        tx.close().await;

        let mut frames = Vec::new();
        rx.read(|payload| {
            frames.push(payload.to_vec());
            true
        })
        .await
        .unwrap();

        assert_eq!(
            frames,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec(), Vec::new()]
        );
    }

    #[tokio::test]
    async fn frames_survive_arbitrary_write_splits() {
        let (read, write) = anon_pipe().expect("anon pipe");
        let rx = FramedPipe::from_owned_fds(Some(read), None).expect("receiver");
        set_nonblocking(write.as_raw_fd()).unwrap();
        let mut raw_tx = pipe::Sender::from_owned_fd(write).expect("raw sender");

        // Two frames as one raw byte stream, delivered in 3-byte slices.
        let mut stream = Vec::new();
        for payload in [&b"hello"[..], b"world!"] {
            stream.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            stream.extend_from_slice(payload);
        }

        let reader = tokio::spawn(async move {
            let mut frames = Vec::new();
            rx.read(|payload| {
                frames.push(payload.to_vec());
                true
            })
            .await
            .unwrap();
            frames
        });

        for chunk in stream.chunks(3) {
            raw_tx.write_all(chunk).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        drop(raw_tx);

        let frames = reader.await.unwrap();
        assert_eq!(frames, vec![b"hello".to_vec(), b"world!".to_vec()]);
    }

    #[tokio::test]
    async fn oversized_frame_grows_the_buffer() {
        let (tx, rx) = framed_pair();
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let expected = payload.clone();
        let reader = tokio::spawn(async move {
            let mut got = Vec::new();
            rx.read(|frame| {
                got.push(frame.to_vec());
                true
            })
            .await
            .unwrap();
            got
        });

        // Larger than the kernel pipe buffer, so the reader must drain
        // concurrently for the write to complete.
        tx.write(&payload).await.unwrap();
        tx.close().await;

        let frames = reader.await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], expected);
    }

    #[tokio::test]
    async fn visitor_can_stop_the_stream() {
        let (tx, rx) = framed_pair();
        tx.write(b"first").await.unwrap();
        tx.write(b"second").await.unwrap();
        tx.close().await;

        let mut seen = 0;
        rx.read(|_| {
            seen += 1;
            false
        })
        .await
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn write_after_close_reports_closed() {
        let (tx, _rx) = framed_pair();
        tx.close().await;
        assert!(matches!(
            tx.write(b"late").await,
            Err(PipeError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (tx, rx) = framed_pair();
        tx.close().await;
        tx.close().await;
        assert!(tx.is_closed());

        rx.close().await;
        rx.close().await;
        assert!(rx.is_closed());
    }
}
