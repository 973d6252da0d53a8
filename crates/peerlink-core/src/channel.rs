//! Bidirectional byte-stream channel to one peer
//!
//! A [`DataChannel`] owns the stream exclusively. The read loop and the write
//! path run independently; either one, or the owner, may close the channel.
//! Only the first close performs the teardown and notifies the handler.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use crate::error::ChannelError;
use crate::peer::HardwareAddress;
use crate::radio::BoxedStream;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identifier
pub type ChannelId = u64;

/// Receives data and close notifications from a channel
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    /// A non-empty chunk arrived; the read loop waits for this to return
    async fn on_data(&self, channel: &Arc<DataChannel>, data: Vec<u8>);

    /// Called exactly once, after the stream has been released
    fn on_closed(&self, channel: &DataChannel, error: Option<&io::Error>);
}

// ----------------------------------------------------------------------------
// Data Channel
// ----------------------------------------------------------------------------

pub struct DataChannel {
    id: ChannelId,
    remote: HardwareAddress,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    handler: Arc<dyn ChannelHandler>,
}

impl DataChannel {
    /// Take ownership of a connected stream and start its read loop
    pub fn open(
        stream: BoxedStream,
        remote: HardwareAddress,
        handler: Arc<dyn ChannelHandler>,
        read_buffer_size: usize,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let (shutdown, _) = watch::channel(false);

        let channel = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            writer: Mutex::new(Some(writer)),
            shutdown,
            closed: AtomicBool::new(false),
            handler,
        });

        debug!("Channel {} to {} opened", channel.id, remote);
        tokio::spawn(read_loop(channel.clone(), reader, read_buffer_size.max(1)));
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn remote(&self) -> HardwareAddress {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write `data` to the peer
    ///
    /// A write failure closes the channel, and the handler sees the error.
    pub async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() || self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;

        let result = tokio::select! {
            result = write_chunk(writer, data) => result,
            _ = shutdown.changed() => return Err(ChannelError::Closed),
        };
        drop(guard);

        match result {
            Ok(()) => {
                trace!("Channel {} sent {} bytes", self.id, data.len());
                Ok(())
            }
            Err(e) => {
                let reported = io::Error::new(e.kind(), e.to_string());
                if let Err(close_err) = self.close(Some(e)).await {
                    debug!("Channel {} close after write error: {}", self.id, close_err);
                }
                Err(ChannelError::Io(reported))
            }
        }
    }

    /// Release the stream and notify the handler
    ///
    /// Only the first call does anything. The handler is notified even when
    /// shutting down the stream fails; that failure is returned to the caller.
    pub async fn close(&self, error: Option<io::Error>) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let writer = self.writer.lock().await.take();
        let result = match writer {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        };

        match &error {
            Some(e) => warn!("Channel {} to {} closed: {}", self.id, self.remote, e),
            None => debug!("Channel {} to {} closed", self.id, self.remote),
        }
        self.handler.on_closed(self, error.as_ref());
        result
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_chunk(writer: &mut WriteHalf<BoxedStream>, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

async fn read_loop(channel: Arc<DataChannel>, mut reader: ReadHalf<BoxedStream>, size: usize) {
    let mut shutdown = channel.shutdown.subscribe();
    let mut buf = vec![0u8; size];

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = shutdown.changed() => break,
        };

        match read {
            Ok(0) => {
                if let Err(e) = channel.close(None).await {
                    debug!("Channel {} close at end of stream: {}", channel.id, e);
                }
                break;
            }
            Ok(n) => {
                trace!("Channel {} received {} bytes", channel.id, n);
                channel.handler.on_data(&channel, buf[..n].to_vec()).await;
            }
            Err(e) => {
                if let Err(close_err) = channel.close(Some(e)).await {
                    debug!("Channel {} close after read error: {}", channel.id, close_err);
                }
                break;
            }
        }
    }
    trace!("Channel {} read loop finished", channel.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
    use tokio::sync::mpsc;

    const REMOTE: HardwareAddress = HardwareAddress::new([0, 1, 2, 3, 4, 5]);

    #[derive(Default)]
    struct Recorder {
        data: StdMutex<Vec<Vec<u8>>>,
        closes: AtomicUsize,
        close_errors: StdMutex<Vec<io::ErrorKind>>,
        echo: bool,
    }

    #[async_trait]
    impl ChannelHandler for Recorder {
        async fn on_data(&self, channel: &Arc<DataChannel>, data: Vec<u8>) {
            if self.echo {
                let _ = channel.send(&data).await;
            }
            self.data.lock().unwrap().push(data);
        }

        fn on_closed(&self, _channel: &DataChannel, error: Option<&io::Error>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = error {
                self.close_errors.lock().unwrap().push(e.kind());
            }
        }
    }

    /// Stream wrapper that counts shutdowns and can fail writes
    struct Tracked {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
        fail_writes: bool,
    }

    impl AsyncRead for Tracked {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Tracked {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fail_writes {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "link lost")));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn tracked_pair(fail_writes: bool) -> (BoxedStream, DuplexStream, Arc<AtomicUsize>) {
        let (local, remote) = tokio::io::duplex(4096);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let stream = Tracked {
            inner: local,
            shutdowns: shutdowns.clone(),
            fail_writes,
        };
        (Box::new(stream), remote, shutdowns)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn forwards_chunks_and_closes_at_end_of_stream() {
        let (stream, mut remote, _) = tracked_pair(false);
        let recorder = Arc::new(Recorder::default());
        let channel = DataChannel::open(stream, REMOTE, recorder.clone(), 1024);

        remote.write_all(b"hello").await.unwrap();
        eventually(|| !recorder.data.lock().unwrap().is_empty()).await;
        assert_eq!(recorder.data.lock().unwrap()[0], b"hello".to_vec());

        drop(remote);
        eventually(|| channel.is_closed()).await;
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
        assert!(recorder.close_errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_are_chunked_by_buffer_size() {
        let (stream, mut remote, _) = tracked_pair(false);
        let recorder = Arc::new(Recorder::default());
        let _channel = DataChannel::open(stream, REMOTE, recorder.clone(), 4);

        remote.write_all(b"abcdefghij").await.unwrap();
        eventually(|| {
            recorder.data.lock().unwrap().iter().map(Vec::len).sum::<usize>() == 10
        })
        .await;
        assert!(recorder.data.lock().unwrap().iter().all(|chunk| chunk.len() <= 4));
    }

    #[tokio::test]
    async fn send_reaches_the_peer() {
        let (stream, mut remote, _) = tracked_pair(false);
        let channel = DataChannel::open(stream, REMOTE, Arc::new(Recorder::default()), 1024);

        channel.send(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn concurrent_close_releases_once() {
        let (stream, _remote, shutdowns) = tracked_pair(false);
        let recorder = Arc::new(Recorder::default());
        let channel = DataChannel::open(stream, REMOTE, recorder.clone(), 1024);

        let mut closers = Vec::new();
        for _ in 0..8 {
            let channel = channel.clone();
            closers.push(tokio::spawn(async move { channel.close(None).await }));
        }
        for closer in closers {
            closer.await.unwrap().unwrap();
        }

        assert!(channel.is_closed());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_failure_closes_with_error() {
        let (stream, _remote, _) = tracked_pair(true);
        let recorder = Arc::new(Recorder::default());
        let channel = DataChannel::open(stream, REMOTE, recorder.clone(), 1024);

        let err = channel.send(b"data").await.unwrap_err();
        assert!(matches!(err, ChannelError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(channel.is_closed());
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            *recorder.close_errors.lock().unwrap(),
            vec![io::ErrorKind::BrokenPipe]
        );

        assert!(matches!(channel.send(b"more").await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn handler_can_reply_from_the_read_loop() {
        let (stream, mut remote, _) = tracked_pair(false);
        let recorder = Arc::new(Recorder {
            echo: true,
            ..Default::default()
        });
        let _channel = DataChannel::open(stream, REMOTE, recorder, 1024);

        remote.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
    }

    #[tokio::test]
    async fn close_from_owner_stops_reading() {
        let (stream, mut remote, _) = tracked_pair(false);
        let (tx, mut rx) = mpsc::unbounded_channel::<usize>();

        struct Counting(mpsc::UnboundedSender<usize>);

        #[async_trait]
        impl ChannelHandler for Counting {
            async fn on_data(&self, _channel: &Arc<DataChannel>, data: Vec<u8>) {
                let _ = self.0.send(data.len());
            }
            fn on_closed(&self, _channel: &DataChannel, _error: Option<&io::Error>) {}
        }

        let channel = DataChannel::open(stream, REMOTE, Arc::new(Counting(tx)), 1024);
        channel.close(None).await.unwrap();

        let _ = remote.write_all(b"late").await;
        let late = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(late, Ok(Some(_))));
    }
}
