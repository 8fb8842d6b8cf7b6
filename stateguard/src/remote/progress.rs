//! Byte accounting for streamed uploads.

use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Reports the running total each time another `step` bytes have passed,
/// and once more when the stream ends.
pub struct ProgressStream<S, F> {
    inner: S,
    sent: u64,
    next_report: u64,
    step: u64,
    on_progress: F,
}

impl<S, F> ProgressStream<S, F>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    F: FnMut(u64) + Unpin,
{
    pub fn new(inner: S, step: u64, on_progress: F) -> Self {
        let step = step.max(1);
        Self {
            inner,
            sent: 0,
            next_report: step,
            step,
            on_progress,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl<S, F> Stream for ProgressStream<S, F>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    F: FnMut(u64) + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_next(cx);

        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                if this.sent >= this.next_report {
                    (this.on_progress)(this.sent);
                    this.next_report = (this.sent / this.step + 1) * this.step;
                }
            }
            Poll::Ready(None) => (this.on_progress)(this.sent),
            _ => {}
        }
        polled
    }
}

/// Human-readable size with binary units, e.g. `1.50 KB`.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    let (unit, scale) = match bytes {
        b if b >= TB => ("TB", TB),
        b if b >= GB => ("GB", GB),
        b if b >= MB => ("MB", MB),
        b if b >= KB => ("KB", KB),
        _ => ("B", 1),
    };
    format!("{:.2} {unit}", bytes as f64 / scale as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    #[tokio::test]
    async fn test_reports_each_step_and_the_end() {
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"abcd")),
            Ok(Bytes::from_static(b"efghij")),
            Ok(Bytes::from_static(b"k")),
        ]);
        let mut reports = Vec::new();
        {
            let mut progress = ProgressStream::new(chunks, 5, |n| reports.push(n));
            while let Some(chunk) = progress.next().await {
                assert!(chunk.is_ok());
            }
            assert_eq!(progress.sent(), 11);
        }
        // 4 bytes: below the first step; 10: crosses 5; 11: crosses 10; end
        assert_eq!(reports, vec![10, 11, 11]);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(120 * 1024 * 1024), "120.00 MB");
    }
}
