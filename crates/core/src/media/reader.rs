//! Encoder reader: the worker that drains encoder output into the frame pool.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::codec::{Encoder, EncoderError, OutputStatus, SharedEncoder};
use crate::media::input::Shared;
use crate::media::queue::Frame;

/// How long one dequeue waits on the encoder. Also bounds how quickly the
/// worker notices `closed`.
pub const READER_TIMEOUT: Duration = Duration::from_millis(10);

/// Dequeue attempts per obtained frame before giving it back.
const DEQUEUE_ATTEMPTS: usize = 3;

pub(crate) fn spawn(encoder: SharedEncoder, shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("encoder-reader".into())
        .spawn(move || run(&encoder, &shared))
}

fn run(encoder: &SharedEncoder, shared: &Shared) {
    tracing::debug!("encoder reader started");
    while !shared.is_closed() {
        match reap(encoder, shared) {
            Ok(()) => {}
            Err(EncoderError::IllegalState(msg)) => {
                tracing::debug!(reason = %msg, "encoder no longer running, reader stopping");
                shared.close();
            }
            Err(e) => {
                tracing::error!(error = %e, "encoder fault, closing input");
                shared.record_fault(e.into());
                shared.close();
            }
        }
    }
    tracing::debug!("encoder reader finished");
}

/// One reader cycle: obtain a frame, try to fill it, queue or return it.
fn reap(encoder: &SharedEncoder, shared: &Shared) -> Result<(), EncoderError> {
    let Some(mut frame) = shared.pool.obtain() else {
        // The encoder decides what to drop; never stall it here.
        tracing::trace!("frame pool is empty, skipping cycle");
        thread::sleep(READER_TIMEOUT);
        return Ok(());
    };

    let mut result = Ok(false);
    for _ in 0..DEQUEUE_ATTEMPTS {
        if shared.is_closed() {
            break;
        }
        let mut enc = encoder.lock();
        result = dequeue_into(&mut **enc, &mut frame, shared);
        if !matches!(result, Ok(false)) {
            break;
        }
    }

    match result {
        Ok(true) => {
            tracing::trace!(
                pts_us = frame.presentation_time_us(),
                size = frame.len(),
                "frame queued"
            );
            shared.pool.queue(frame);
            Ok(())
        }
        Ok(false) => {
            shared.pool.recycle(frame);
            Ok(())
        }
        Err(e) => {
            shared.pool.recycle(frame);
            Err(e)
        }
    }
}

/// Returns `Ok(true)` when `frame` was filled with a coded buffer.
fn dequeue_into(
    encoder: &mut dyn Encoder,
    frame: &mut Frame,
    shared: &Shared,
) -> Result<bool, EncoderError> {
    match encoder.dequeue_output_buffer(READER_TIMEOUT)? {
        OutputStatus::Buffer { index, info } => {
            let copied = encoder.output_buffer(index).map(|buf| frame.set(buf, &info));
            encoder.release_output_buffer(index)?;
            copied?;
            Ok(true)
        }
        OutputStatus::FormatChanged => {
            let format = encoder.output_format();
            tracing::debug!(
                mime = %format.mime,
                csd0 = format.csd(0).map_or(0, <[u8]>::len),
                csd1 = format.csd(1).map_or(0, <[u8]>::len),
                "encoder output format changed"
            );
            shared.set_format(format);
            Ok(false)
        }
        OutputStatus::BuffersChanged => {
            tracing::trace!("encoder output buffers changed");
            Ok(false)
        }
        OutputStatus::TryAgainLater => Ok(false),
    }
}
