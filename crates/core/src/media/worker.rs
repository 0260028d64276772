//! Thread that runs a [`Packetizer`] over a [`CodecInputStream`].

use std::io;
use std::thread::{self, JoinHandle};

use super::Packetizer;
use super::input::{CodecInputStream, InputCloser};
use crate::error::{Result, StreamError};

type Finished = (Box<dyn Packetizer>, Result<()>);

/// Owns the packetizer thread of one stream.
///
/// The packetizer comes back from [`stop`](Self::stop) so a restarted
/// stream keeps its SSRC and sequence space.
pub struct PacketizerWorker {
    closer: InputCloser,
    handle: Option<JoinHandle<Finished>>,
}

impl PacketizerWorker {
    pub fn spawn(
        name: &str,
        mut packetizer: Box<dyn Packetizer>,
        mut input: CodecInputStream,
    ) -> io::Result<Self> {
        let closer = input.closer();
        let handle = thread::Builder::new()
            .name(format!("{name}-packetizer"))
            .spawn(move || {
                let result = packetizer.run(&mut input);
                if let Err(e) = &result {
                    tracing::error!(error = %e, codec = packetizer.codec_name(), "packetizer failed");
                }
                // Stops and joins the encoder reader before reporting back.
                drop(input);
                (packetizer, result)
            })?;
        Ok(Self {
            closer,
            handle: Some(handle),
        })
    }

    /// Whether the thread has exited on its own (end of stream or fault).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Close the input, wait for the thread and hand the packetizer back.
    ///
    /// A transport error from the packetizer wins over an encoder fault.
    pub fn stop(mut self) -> (Option<Box<dyn Packetizer>>, Result<()>) {
        self.closer.close();
        let Some(handle) = self.handle.take() else {
            return (None, Ok(()));
        };
        match handle.join() {
            Ok((packetizer, result)) => {
                let result = result.and_then(|()| match self.closer.take_fault() {
                    Some(fault) => Err(fault),
                    None => Ok(()),
                });
                (Some(packetizer), result)
            }
            Err(_) => (
                None,
                Err(StreamError::EncoderFault("packetizer thread panicked".into())),
            ),
        }
    }
}

impl Drop for PacketizerWorker {
    fn drop(&mut self) {
        self.closer.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
