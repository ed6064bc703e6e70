//! Moves bytes from a [`Source`] into a [`Sink`] under the sink's credit.
use crate::error::{Result, WriteError};
use crate::sink::Sink;
use crate::source::Source;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs one transfer to completion.
///
/// Every iteration asks the sink how much it can take and pulls at most that
/// much from the source, so no more than one credit's worth of data is ever
/// in flight. `on_progress` receives `(bytes_read, bytes_written)` after
/// every chunk.
///
/// When `cancel` is raised the source is destroyed and the pump returns
/// [`WriteError::Aborted`] without finishing the sink.
pub(crate) fn pump<S, K, F>(
    source: &mut S,
    sink: &mut K,
    cancel: &AtomicBool,
    mut on_progress: F,
) -> Result<()>
where
    S: Source + ?Sized,
    K: Sink + ?Sized,
    F: FnMut(u64, u64),
{
    loop {
        if cancel.load(Ordering::SeqCst) {
            source.destroy();
            return Err(WriteError::Aborted);
        }

        let credit = sink.request_size();
        let Some(chunk) = source.pull(credit).map_err(WriteError::Source)? else {
            break;
        };

        if chunk.is_empty() {
            continue;
        }

        // A source handing out more than it was asked for would defeat the
        // flow control.
        debug_assert!(chunk.len() <= credit);

        sink.accept(&chunk).map_err(WriteError::Sink)?;
        on_progress(source.bytes_read(), sink.bytes_written());
    }

    if cancel.load(Ordering::SeqCst) {
        source.destroy();
        return Err(WriteError::Aborted);
    }

    sink.finish().map_err(WriteError::Sink)?;
    on_progress(source.bytes_read(), sink.bytes_written());
    Ok(())
}
